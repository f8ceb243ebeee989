//! Groups runs of equal keys in a pre-sorted `key<sep>value` line stream,
//! the shape reduce implementations usually want their inputs in.

use itertools::Itertools;

/// Collects consecutive lines sharing a key into `(key, values)` groups.
/// Lines without the separator are skipped. The input must already be
/// sorted by key or equal keys will surface in multiple groups.
pub fn group_sorted<I>(lines: I, sep: char) -> Vec<(String, Vec<String>)>
where
    I: IntoIterator<Item = String>,
{
    let parsed = lines.into_iter().filter_map(move |line| {
        let (k, v) = line.split_once(sep)?;
        Some((k.to_string(), v.to_string()))
    });
    let grouped = parsed.chunk_by(|(k, _)| k.clone());
    let mut out = Vec::new();
    for (key, group) in &grouped {
        out.push((key, group.map(|(_, v)| v).collect()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_consecutive_keys() {
        let groups = group_sorted(lines(&["a\t1", "a\t2", "b\t3"]), '\t');
        assert_eq!(
            groups,
            vec![
                ("a".to_string(), vec!["1".to_string(), "2".to_string()]),
                ("b".to_string(), vec!["3".to_string()]),
            ]
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let groups = group_sorted(lines(&["a\t1", "garbage", "a\t2"]), '\t');
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(group_sorted(Vec::<String>::new(), '\t').is_empty());
    }
}
