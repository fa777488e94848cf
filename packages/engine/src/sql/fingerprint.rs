use xxhash_rust::xxh3::Xxh3;

/// Stable fingerprint of an emitted plan: xxh3-64 over the canonical text of
/// every planned statement in order. Byte-identical for a fixed SQL input and
/// catalog snapshot, which is what tests assert against.
pub(crate) fn plan_fingerprint<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Xxh3::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    format!("{:016x}", hasher.digest())
}

#[cfg(test)]
mod tests {
    use super::plan_fingerprint;

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let first = plan_fingerprint(["SELECT 1", "SELECT 2"].into_iter());
        let second = plan_fingerprint(["SELECT 1", "SELECT 2"].into_iter());
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn statement_boundaries_are_part_of_the_hash() {
        let joined = plan_fingerprint(["SELECT 12", ""].into_iter());
        let split = plan_fingerprint(["SELECT 1", "2"].into_iter());
        assert_ne!(joined, split);
    }
}
