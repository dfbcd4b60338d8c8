use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::trace;
use url::Url;

use crate::config::SiteProfile;
use crate::error::{ExtractionError, FetchError};
use crate::fetch::Document;
use crate::models::RawProductRecord;

static ID_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|\s)ID\s*[：:]").unwrap());
static NAME_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|\s)Name\s*[：:]").unwrap());
static DESCRIBE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)Describe\s*[：:]").unwrap());
static PRICE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)Price\s*[：:]").unwrap());
static DETAIL_IMAGES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)detail\s+images").unwrap());
static CATEGORY_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"path=[\d_]+_(\d+)").unwrap());
static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());

const CELL_TAGS: &[&str] = &["td", "span", "div"];
const PROSE_TAGS: &[&str] = &["td", "span", "div", "p"];

/// A label-anchored field: the label predicate plus the tags a value may live in.
pub struct LabeledField {
    pub name: &'static str,
    pub label: &'static LazyLock<Regex>,
    pub value_tags: &'static [&'static str],
}

pub static ID_FIELD: LabeledField = LabeledField { name: "id", label: &ID_LABEL, value_tags: CELL_TAGS };
pub static TITLE_FIELD: LabeledField = LabeledField { name: "title", label: &NAME_LABEL, value_tags: CELL_TAGS };
pub static DESCRIPTION_FIELD: LabeledField =
    LabeledField { name: "description", label: &DESCRIBE_LABEL, value_tags: PROSE_TAGS };
pub static PRICE_FIELD: LabeledField = LabeledField { name: "price", label: &PRICE_LABEL, value_tags: CELL_TAGS };

type Locator = fn(&Html, &LabeledField) -> Option<String>;

/// Tried in order; the first locator producing a non-empty value wins.
const LOCATORS: &[(&str, Locator)] = &[("inline", inline_value), ("next_element", next_element_value)];

/// Build a record from a fetched detail page. Only a missing document is an error.
pub fn extract(
    fetched: Result<Document, FetchError>,
    url: &str,
    site: &SiteProfile,
) -> Result<RawProductRecord, ExtractionError> {
    let doc = fetched.map_err(|source| ExtractionError::NoDocument {
        url: url.to_string(),
        source,
    })?;
    Ok(extract_document(&doc, url, site))
}

pub fn extract_document(doc: &Document, url: &str, site: &SiteProfile) -> RawProductRecord {
    let html = Html::parse_document(&doc.html);

    let internal_id = locate(&html, &ID_FIELD).or_else(|| id_from_path(url, site));

    RawProductRecord {
        product_url: url.to_string(),
        category_id: category_from_path(url),
        internal_id,
        title: locate(&html, &TITLE_FIELD),
        description: locate(&html, &DESCRIPTION_FIELD),
        price: locate(&html, &PRICE_FIELD),
        image_urls: collect_images(&html, &doc.url, site),
        scraped_at: Utc::now(),
    }
}

pub fn locate(html: &Html, field: &LabeledField) -> Option<String> {
    LOCATORS.iter().find_map(|(how, locator)| {
        let value = locator(html, field)?;
        trace!("{} located {}", field.name, how);
        Some(value)
    })
}

/// `ID：655730` in a single text node.
fn inline_value(html: &Html, field: &LabeledField) -> Option<String> {
    let label: &Regex = field.label;
    html.root_element()
        .descendants()
        .filter_map(|node| node.value().as_text().map(|t| &**t))
        .find_map(|text| label.find(text).map(|m| &text[m.end()..]))
        .and_then(clean)
}

/// `<td>ID：</td><td>655730</td>`: first value-bearing element after the label.
fn next_element_value(html: &Html, field: &LabeledField) -> Option<String> {
    let label: &Regex = field.label;
    let mut passed_label = false;
    for node in html.root_element().descendants() {
        if !passed_label {
            passed_label = node
                .value()
                .as_text()
                .is_some_and(|t| label.is_match(t));
            continue;
        }
        if let Some(el) = ElementRef::wrap(node) {
            let tag = el.value().name();
            if field.value_tags.iter().any(|t| *t == tag) {
                return clean(&el.text().collect::<String>());
            }
        }
    }
    None
}

fn clean(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

/// Images from the "Detail Images" block, else anything under the upload path.
fn collect_images(html: &Html, base: &Url, site: &SiteProfile) -> BTreeSet<String> {
    let detail: BTreeSet<String> = detail_region(html)
        .map(|region| {
            region
                .select(&IMG)
                .filter_map(|img| img.value().attr("src"))
                .filter_map(|src| absolutize(base, src))
                .collect()
        })
        .unwrap_or_default();
    if !detail.is_empty() {
        return detail;
    }

    html.select(&IMG)
        .filter_map(|img| img.value().attr("src"))
        .filter(|src| src.contains(&site.upload_marker))
        .filter_map(|src| absolutize(base, src))
        .collect()
}

/// Nearest enclosing table of the "Detail Images" caption, else nearest div.
fn detail_region(html: &Html) -> Option<ElementRef<'_>> {
    let caption = html
        .root_element()
        .descendants()
        .find(|node| node.value().as_text().is_some_and(|t| DETAIL_IMAGES.is_match(t)))?;

    let enclosing = |tag: &str| {
        caption
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == tag)
    };
    enclosing("table").or_else(|| enclosing("div"))
}

fn absolutize(base: &Url, src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    base.join(src).ok().map(|u| u.to_string())
}

/// Last numeral of the hierarchical `path=` parameter.
pub fn category_from_path(url: &str) -> Option<String> {
    CATEGORY_PATH_RE.captures(url).map(|c| c[1].to_string())
}

fn id_from_path(url: &str, site: &SiteProfile) -> Option<String> {
    site.product_id.captures(url).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://bags.qiqiyg.com/productinfoen_655730.html?path=0_37771_44188";

    fn doc(html: &str) -> Document {
        Document::new(Url::parse(PAGE_URL).unwrap(), html)
    }

    fn fixture(name: &str) -> Document {
        let html = std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap();
        doc(&html)
    }

    #[test]
    fn marc_jacobs_fixture() {
        let site = SiteProfile::default();
        let r = extract_document(&fixture("product_655730"), PAGE_URL, &site);
        assert_eq!(r.internal_id.as_deref(), Some("655730"));
        assert_eq!(r.title.as_deref(), Some("Marc Jacobs jy (65)"));
        assert_eq!(r.description.as_deref(), Some("Marc Jacobs jy (65)"));
        assert_eq!(r.category_id.as_deref(), Some("44188"));
        assert_eq!(r.image_urls.len(), 1);
        assert!(r
            .image_urls
            .contains("https://pic.qiqi2000.com/upfile/product/202204/Marc%20Jacobs%20jy%20(65)_655730.png"));
    }

    #[test]
    fn duplicate_images_collapse_regardless_of_order() {
        let site = SiteProfile::default();
        let a = extract_document(
            &doc(r#"<img src="/upfile/b.jpg"><img src="/upfile/a.jpg"><img src="https://bags.qiqiyg.com/upfile/a.jpg">"#),
            PAGE_URL,
            &site,
        );
        let b = extract_document(
            &doc(r#"<img src="/upfile/a.jpg"><img src="/upfile/b.jpg"><img src="/upfile/b.jpg">"#),
            PAGE_URL,
            &site,
        );
        assert_eq!(a.image_urls, b.image_urls);
        assert_eq!(
            a.image_urls.iter().collect::<Vec<_>>(),
            vec![
                "https://bags.qiqiyg.com/upfile/a.jpg",
                "https://bags.qiqiyg.com/upfile/b.jpg",
            ]
        );
    }

    #[test]
    fn detail_region_wins_over_upload_fallback() {
        let html = r#"
            <img src="/upfile/logo.png">
            <table><tr><td>Detail Images</td></tr>
              <tr><td><img src="/images/detail1.jpg"></td></tr></table>"#;
        let r = extract_document(&doc(html), PAGE_URL, &SiteProfile::default());
        assert_eq!(
            r.image_urls.iter().collect::<Vec<_>>(),
            vec!["https://bags.qiqiyg.com/images/detail1.jpg"]
        );
    }

    #[test]
    fn empty_detail_region_falls_back() {
        let html = r#"
            <div>Detail Images</div>
            <img src="/upfile/p1.jpg"><img src="/static/banner.jpg">"#;
        let r = extract_document(&doc(html), PAGE_URL, &SiteProfile::default());
        assert_eq!(
            r.image_urls.iter().collect::<Vec<_>>(),
            vec!["https://bags.qiqiyg.com/upfile/p1.jpg"]
        );
    }

    #[test]
    fn inline_label_value() {
        let html = "<div>ID：123456</div><div>Name: Tote bag</div>";
        let r = extract_document(&doc(html), PAGE_URL, &SiteProfile::default());
        assert_eq!(r.internal_id.as_deref(), Some("123456"));
        assert_eq!(r.title.as_deref(), Some("Tote bag"));
    }

    #[test]
    fn missing_fields_are_none_and_id_falls_back_to_path() {
        let r = extract_document(&doc("<p>nothing here</p>"), PAGE_URL, &SiteProfile::default());
        assert_eq!(r.internal_id.as_deref(), Some("655730"));
        assert!(r.title.is_none());
        assert!(r.description.is_none());
        assert!(r.price.is_none());
        assert!(r.image_urls.is_empty());
    }

    #[test]
    fn unfetched_page_is_no_document() {
        let err = extract(
            Err(FetchError::status(PAGE_URL, 500)),
            PAGE_URL,
            &SiteProfile::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::NoDocument { .. }));
    }

    #[test]
    fn category_is_last_path_numeral() {
        assert_eq!(category_from_path(PAGE_URL).as_deref(), Some("44188"));
        assert_eq!(
            category_from_path("https://x/categoryen_37771.html?path=0_37771").as_deref(),
            Some("37771")
        );
        assert_eq!(category_from_path("https://x/productinfoen_1.html"), None);
    }
}
