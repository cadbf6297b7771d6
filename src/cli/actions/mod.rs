pub mod run;

use crate::config::Settings;

#[derive(Debug)]
pub enum Action {
    Run { settings: Settings },
}
