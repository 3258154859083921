// Link deduplication for one research iteration
//
// Search results from every query of a batch are merged into a single
// ordered set of links. The first query that surfaced a URL keeps it.

use std::collections::HashSet;
use tracing::debug;

/// A URL together with the search query that first returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub url: String,
    pub query: String,
}

/// Merge per-query result lists into unique links, first-seen-wins.
///
/// `results` pairs each query with its ordered URL list, in batch order.
/// Blank URLs are skipped; every other URL is kept exactly as returned.
/// The output keeps insertion order.
pub fn dedup_links<Q, L>(results: &[(Q, L)]) -> Vec<DiscoveredLink>
where
    Q: AsRef<str>,
    L: AsRef<[String]>,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut links = Vec::new();

    for (query, urls) in results {
        for url in urls.as_ref() {
            if url.trim().is_empty() {
                continue;
            }
            if seen.insert(url.as_str()) {
                links.push(DiscoveredLink {
                    url: url.to_string(),
                    query: query.as_ref().to_string(),
                });
            } else {
                debug!("Skipping duplicate link {} from '{}'", url, query.as_ref());
            }
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_seen_wins() {
        let results = vec![("q1", urls(&["a", "b"])), ("q2", urls(&["b", "c"]))];
        let links = dedup_links(&results);

        let found: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(found, vec!["a", "b", "c"]);
        assert_eq!(links[0].query, "q1");
        assert_eq!(links[1].query, "q1");
        assert_eq!(links[2].query, "q2");
    }

    #[test]
    fn test_duplicates_within_one_list() {
        let results = vec![("q1", urls(&["a", "a", "b"]))];
        let links = dedup_links(&results);
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn test_empty_results_and_blank_urls() {
        let results: Vec<(&str, Vec<String>)> =
            vec![("q1", vec![]), ("q2", urls(&["", "  ", "x"]))];
        let links = dedup_links(&results);
        assert_eq!(
            links,
            vec![DiscoveredLink {
                url: "x".to_string(),
                query: "q2".to_string()
            }]
        );
    }

    #[test]
    fn test_urls_kept_verbatim() {
        let results = vec![("q1", urls(&["https://a.example/ ", "https://a.example/"]))];
        let links = dedup_links(&results);
        let found: Vec<&str> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(found, vec!["https://a.example/ ", "https://a.example/"]);
    }
}
