use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::cleaner::clean_text;

#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub title: String,
    pub content: String,
    pub links: Vec<String>,
}

/// Pulls the title, the text of the main content region and every outbound
/// http(s) link. Returns `None` when the region is missing from the document.
pub fn parse_html(document: &str, base_url: &Url, region: &Selector) -> Option<ParsedPage> {
    let html = Html::parse_document(document);
    let main = html.select(region).next()?;

    let title = first_text(main, "h1")
        .or_else(|| first_text(html.root_element(), "title"))
        .unwrap_or_else(|| base_url.to_string());

    let content = clean_text(&main.text().collect::<Vec<_>>().join(" "));

    let mut links = Vec::new();
    if let Ok(link_sel) = Selector::parse("a[href]") {
        for el in html.select(&link_sel) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            if let Ok(url) = base_url.join(href) {
                if url.scheme() == "http" || url.scheme() == "https" {
                    links.push(url.to_string());
                }
            }
        }
    }

    Some(ParsedPage {
        title,
        content,
        links,
    })
}

fn first_text(scope: ElementRef, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    scope
        .select(&sel)
        .next()
        .map(|el| clean_text(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
}
