//! Topic names and filters
//!
//! Validation of configured topic sets and the filter matching used to
//! route inbound PUBLISH packets to the subscription streams that asked for them.

pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

/// Collapse duplicate filters, keeping the first occurrence of each.
///
/// Every filter of a topic set must be subscribed exactly once.
pub fn dedup_filters<I, S>(filters: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut unique: Vec<String> = Vec::new();
    for filter in filters {
        let filter = filter.into();
        if !unique.contains(&filter) {
            unique.push(filter);
        }
    }
    unique
}
