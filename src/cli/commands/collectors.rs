use crate::collectors::{COLLECTOR_NAMES, DISABLED_BY_DEFAULT};
use clap::{Arg, ArgMatches, Command};
use std::collections::HashSet;

/// Add an enable/disable flag pair per known collector, with the default
/// state taken from the collector registry.
pub fn add_collectors_args(mut cmd: Command) -> Command {
    for &name in COLLECTOR_NAMES {
        let default_enabled = !DISABLED_BY_DEFAULT.contains(&name);

        let enable_flag: &'static str = Box::leak(format!("collector.{name}").into_boxed_str());
        let disable_flag: &'static str =
            Box::leak(format!("no-collector.{name}").into_boxed_str());

        let default_indicator = if default_enabled {
            " [default: enabled]"
        } else {
            " [default: disabled]"
        };
        let enable_help: &'static str = Box::leak(
            format!("Enable the {name} collector{default_indicator}").into_boxed_str(),
        );
        let disable_help: &'static str =
            Box::leak(format!("Disable the {name} collector").into_boxed_str());

        cmd = cmd
            .arg(
                Arg::new(enable_flag)
                    .long(enable_flag)
                    .help(enable_help)
                    .action(clap::ArgAction::SetTrue)
                    .default_value(if default_enabled { "true" } else { "false" }),
            )
            .arg(
                Arg::new(disable_flag)
                    .long(disable_flag)
                    .help(disable_help)
                    .action(clap::ArgAction::SetTrue)
                    .overrides_with(enable_flag),
            );
    }
    cmd
}

/// Resolve the enabled collector set from the parsed flags.
pub fn enabled_collectors(matches: &ArgMatches) -> HashSet<String> {
    COLLECTOR_NAMES
        .iter()
        .filter(|name| {
            let enabled = matches.get_flag(&format!("collector.{name}"));
            let disabled = matches.get_flag(&format!("no-collector.{name}"));
            enabled && !disabled
        })
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(args: &[&str]) -> ArgMatches {
        let cmd = add_collectors_args(Command::new("test"));
        let mut argv = vec!["test"];
        argv.extend_from_slice(args);
        cmd.get_matches_from(argv)
    }

    #[test]
    fn test_defaults_follow_registry() {
        let enabled = enabled_collectors(&matches(&[]));

        assert!(enabled.contains("segment"));
        assert!(enabled.contains("cluster_state"));
        assert!(enabled.contains("vacuum_running"));
        assert!(!enabled.contains("gpbackup_history"));
        assert!(!enabled.contains("table_health"));
    }

    #[test]
    fn test_disable_flag_wins() {
        let enabled = enabled_collectors(&matches(&["--no-collector.segment"]));
        assert!(!enabled.contains("segment"));
        assert!(enabled.contains("cluster_state"));
    }

    #[test]
    fn test_opt_in_collector_can_be_enabled() {
        let enabled = enabled_collectors(&matches(&["--collector.gpbackup_history"]));
        assert!(enabled.contains("gpbackup_history"));
    }
}
