use std::sync::LazyLock;

use scraper::{Html, Selector};

static OG_IMAGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:image"]"#).unwrap());
static TWITTER_IMAGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="twitter:image"]"#).unwrap());
static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());

const ASSET_HINTS: &[&str] = &["/product", "/media", "cdn"];

/// Representative image of an official product page: og:image, twitter:image, then
/// the first absolute image that looks like a product asset.
pub fn representative_image(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    meta_content(&doc, &OG_IMAGE)
        .or_else(|| meta_content(&doc, &TWITTER_IMAGE))
        .or_else(|| asset_image(&doc))
}

fn meta_content(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(String::from)
}

fn asset_image(doc: &Html) -> Option<String> {
    doc.select(&IMG)
        .filter_map(|img| img.value().attr("src"))
        .find(|src| {
            let lower = src.to_lowercase();
            src.starts_with("http") && ASSET_HINTS.iter().any(|h| lower.contains(h))
        })
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_open_graph() {
        let html = r#"<head>
            <meta name="twitter:image" content="https://cdn.example.com/tw.jpg">
            <meta property="og:image" content="https://cdn.example.com/og.jpg">
        </head>"#;
        assert_eq!(representative_image(html).as_deref(), Some("https://cdn.example.com/og.jpg"));
    }

    #[test]
    fn twitter_then_asset_image() {
        let tw = r#"<meta name="twitter:image" content="https://x.com/tw.jpg">"#;
        assert_eq!(representative_image(tw).as_deref(), Some("https://x.com/tw.jpg"));

        let imgs = r#"<img src="/relative/product/a.jpg">
            <img src="https://shop.example.com/static/logo.png">
            <img src="https://shop.example.com/media/catalog/bag.jpg">"#;
        assert_eq!(
            representative_image(imgs).as_deref(),
            Some("https://shop.example.com/media/catalog/bag.jpg")
        );
    }

    #[test]
    fn nothing_usable() {
        assert_eq!(representative_image(r#"<meta property="og:image" content="  ">"#), None);
        assert_eq!(representative_image("<p>no images</p>"), None);
    }
}
