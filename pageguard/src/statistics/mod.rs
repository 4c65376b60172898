use std::fmt::{Display, Formatter};

use itertools::Itertools;

pub mod guard;

#[macro_export]
macro_rules! statistics_list {
    ($($name:ident = $value:expr),*) => {
        Box::new(
            [
                $(
                    (::std::stringify!($name).to_owned(), Box::new($value) as Box<dyn $crate::statistics::StatisticValue>)
                ),*
            ]
        )
    };
}

pub trait StatisticsProvider {
    fn class_name(&self) -> &'static str;

    fn statistics(&self) -> Box<[(String, Box<dyn StatisticValue>)]>;
}

pub trait StatisticValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result;
}

impl StatisticValue for u64 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for dyn StatisticValue + '_ {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        StatisticValue::fmt(self, f)
    }
}

/// One `class.name=value` line per statistic.
pub fn as_text(provider: &dyn StatisticsProvider) -> String {
    let class_name = provider.class_name();

    provider
        .statistics()
        .iter()
        .map(|(name, value)| format!("{class_name}.{name}={value}"))
        .join("\n")
}
