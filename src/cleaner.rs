use std::collections::HashSet;

use url::Url;

/// Query parameters that select a view, tab or pivot of the same page (plus
/// campaign tracking) and therefore never change what a page is.
pub const NON_SEMANTIC_PARAMS: &[&str] = &[
    "view",
    "tabs",
    "pivots",
    "tabs-pivot",
    "source",
    "wt.mc_id",
];

pub fn clean_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turns raw links into crawl identity keys.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    removable: HashSet<String>,
}

impl Default for UrlNormalizer {
    fn default() -> Self {
        Self::new(NON_SEMANTIC_PARAMS.iter().copied())
    }
}

impl UrlNormalizer {
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            removable: params
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Strips the fragment and the non-semantic query parameters. Remaining
    /// parameters are sorted by key so that parameter order does not produce
    /// distinct keys. Unparseable input comes back untouched.
    pub fn normalize(&self, raw: &str) -> String {
        let Ok(mut url) = Url::parse(raw) else {
            return raw.to_string();
        };
        url.set_fragment(None);

        let mut query_pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !self.removable.contains(&k.to_ascii_lowercase()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if query_pairs.is_empty() {
            url.set_query(None);
        } else {
            query_pairs.sort_by(|a, b| a.0.cmp(&b.0));
            url.query_pairs_mut()
                .clear()
                .extend_pairs(query_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_and_view_params_collapse_to_one_key() {
        let normalizer = UrlNormalizer::default();
        let base = normalizer.normalize("https://learn.microsoft.com/en-us/azure/storage/");
        for variant in [
            "https://learn.microsoft.com/en-us/azure/storage/#overview",
            "https://learn.microsoft.com/en-us/azure/storage/?view=azure-cli-latest",
            "https://learn.microsoft.com/en-us/azure/storage/?tabs=portal&pivots=python#step-2",
            "https://learn.microsoft.com/en-us/azure/storage/?WT.mc_id=email",
        ] {
            assert_eq!(normalizer.normalize(variant), base, "{variant}");
        }
    }

    #[test]
    fn semantic_params_survive_in_sorted_order() {
        let normalizer = UrlNormalizer::default();
        let a = normalizer.normalize("https://site.example/docs/?page=2&lang=en&view=x");
        let b = normalizer.normalize("https://site.example/docs/?lang=en&page=2");
        assert_eq!(a, b);
        assert_eq!(a, "https://site.example/docs/?lang=en&page=2");
    }

    #[test]
    fn normalization_is_idempotent() {
        let normalizer = UrlNormalizer::default();
        for raw in [
            "https://site.example/docs/",
            "https://site.example/docs/a b?q=hello world&tabs=1#x",
            "https://site.example/docs/?z=%2F&a=1",
            "HTTPS://Site.Example/Docs/?",
            "not a url",
            "",
        ] {
            let once = normalizer.normalize(raw);
            assert_eq!(normalizer.normalize(&once), once, "{raw}");
        }
    }

    #[test]
    fn malformed_urls_pass_through() {
        let normalizer = UrlNormalizer::default();
        assert_eq!(normalizer.normalize("/relative/path#frag"), "/relative/path#frag");
    }

    #[test]
    fn custom_param_list_is_case_insensitive() {
        let normalizer = UrlNormalizer::new(["Utm_Source"]);
        assert_eq!(
            normalizer.normalize("https://site.example/?utm_source=feed&view=keep"),
            "https://site.example/?view=keep"
        );
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  a\n\tb   c "), "a b c");
    }
}
