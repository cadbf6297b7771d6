/// Single place to wire up collectors. Declaration order is scrape order
/// within each collector group.
macro_rules! register_collectors {
    (
        $(
            $name:ident => $factory:path
        ),* $(,)?
    ) => {
        /// Factories for every known collector, in declaration order.
        #[must_use]
        pub fn all_factories() -> Vec<(&'static str, CollectorFactory)> {
            vec![
                $(
                    (stringify!($name), $factory as CollectorFactory),
                )*
            ]
        }

        /// Names of every known collector, in declaration order.
        pub const COLLECTOR_NAMES: &[&'static str] = &[
            $(stringify!($name),)*
        ];
    };
}
