//! Example MapReduce applications that run on the driver.

use common::Workload;

pub mod grep;
pub mod word_count;

/// Look up a workload by its registered name.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" | "word-count" => Some(Workload {
            map_fn: word_count::map,
            reduce_fn: word_count::reduce,
        }),
        "grep" => Some(Workload {
            map_fn: grep::map,
            reduce_fn: grep::reduce,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert!(try_named("wc").is_some());
        assert!(try_named("grep").is_some());
        assert!(try_named("tera-sort").is_none());
    }
}
