use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use tracing::info;

use crate::models::{Checkpoint, MatchResult, ReviewSignal, RunRecord};

const GALLERY_SLOTS: usize = 9;

pub const SINK_COLUMNS: [&str; 22] = [
    "category_id",
    "product_internal_id",
    "brand",
    "product_name",
    "product_sku",
    "product_description",
    "product_supplier",
    "product_supplier_url",
    "product_cost_price",
    "product_compare_to_price",
    "product_price",
    "product_media_main_image_url",
    "product_media_gallery_image_url_1",
    "product_media_gallery_image_url_2",
    "product_media_gallery_image_url_3",
    "product_media_gallery_image_url_4",
    "product_media_gallery_image_url_5",
    "product_media_gallery_image_url_6",
    "product_media_gallery_image_url_7",
    "product_media_gallery_image_url_8",
    "product_media_gallery_image_url_9",
    "needs_review",
];

pub const RUN_LOG_COLUMNS: [&str; 12] = [
    "run_id",
    "started_at",
    "finished_at",
    "supplier_name",
    "total_products",
    "matched_products",
    "needs_review_yes",
    "needs_review_no",
    "avg_match_confidence",
    "min_match_confidence",
    "max_match_confidence",
    "discover_limit",
];

// ── Rows ──

/// One sink row, built from a checkpoint and its reviewed match.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub category_id: String,
    pub internal_id: String,
    pub brand: String,
    pub product_name: String,
    pub sku: String,
    pub description: String,
    pub supplier: String,
    pub supplier_url: String,
    pub cost_price: String,
    pub compare_to_price: String,
    pub price: String,
    pub main_image: String,
    pub gallery: [String; GALLERY_SLOTS],
    pub needs_review: ReviewSignal,
}

impl ExportRow {
    pub fn build(supplier: &str, cp: &Checkpoint, m: &MatchResult, needs_review: ReviewSignal) -> Self {
        let raw = &cp.raw;
        let title = raw.title.clone().unwrap_or_default();
        let (main_image, gallery) = split_images(raw.image_urls.iter().map(String::as_str));
        let cost_price = normalize_price(raw.price.as_deref());

        Self {
            category_id: raw.category_id.clone().unwrap_or_default(),
            internal_id: cp.internal_id().to_string(),
            brand: m
                .official_brand
                .clone()
                .or_else(|| cp.inference.inferred_brand.clone())
                .unwrap_or_default(),
            product_name: m.official_product_name.clone().unwrap_or_else(|| title.clone()),
            sku: m.official_sku.clone().unwrap_or_default(),
            description: raw
                .description
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or(title),
            supplier: supplier.to_string(),
            supplier_url: raw.product_url.clone(),
            price: cost_price.clone(),
            cost_price,
            compare_to_price: normalize_price(m.official_price.as_deref()),
            main_image,
            gallery,
            needs_review,
        }
    }

    fn into_record(self) -> Vec<String> {
        let mut record = vec![
            self.category_id,
            self.internal_id,
            self.brand,
            self.product_name,
            self.sku,
            self.description,
            self.supplier,
            self.supplier_url,
            self.cost_price,
            self.compare_to_price,
            self.price,
            self.main_image,
        ];
        record.extend(self.gallery);
        record.push(self.needs_review.to_string());
        record
    }
}

/// Main image skips logos when it can; the rest fill the gallery.
fn split_images<'a>(images: impl Iterator<Item = &'a str>) -> (String, [String; GALLERY_SLOTS]) {
    let images: Vec<&str> = images.collect();
    let main = images
        .iter()
        .find(|img| !img.to_lowercase().contains("logo"))
        .or_else(|| images.first())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let mut gallery: [String; GALLERY_SLOTS] = Default::default();
    for (slot, img) in gallery
        .iter_mut()
        .zip(images.iter().filter(|img| **img != main))
    {
        *slot = img.to_string();
    }
    (main, gallery)
}

/// Strip currency symbols and thousands separators.
pub fn normalize_price(text: Option<&str>) -> String {
    text.map(|t| {
        t.chars()
            .filter(|c| !matches!(c, '$' | '€' | '£' | ','))
            .collect::<String>()
            .trim()
            .to_string()
    })
    .unwrap_or_default()
}

// ── Sinks ──

/// Append-only CSV, flushed after every row.
pub struct ProductSink {
    path: PathBuf,
}

impl ProductSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: ExportRow) -> Result<()> {
        let id = row.internal_id.clone();
        let review = row.needs_review;
        append_record(&self.path, &SINK_COLUMNS, &row.into_record())?;
        info!("Appended row for {} (review: {})", id, review);
        Ok(())
    }
}

pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, run: &RunRecord) -> Result<()> {
        let record = vec![
            run.run_id.clone(),
            run.started_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            run.finished_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            run.supplier_name.clone(),
            run.total.to_string(),
            run.matched.to_string(),
            run.needs_review_yes.to_string(),
            run.needs_review_no.to_string(),
            format!("{:.4}", run.avg_confidence),
            format!("{:.4}", run.min_confidence),
            format!("{:.4}", run.max_confidence),
            run.discover_limit.map(|n| n.to_string()).unwrap_or_default(),
        ];
        append_record(&self.path, &RUN_LOG_COLUMNS, &record)?;
        info!("Run {} logged to {}", run.run_id, self.path.display());
        Ok(())
    }
}

fn append_record(path: &Path, header: &[&str], record: &[String]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if needs_header {
        writer.write_record(header)?;
    }
    writer.write_record(record)?;
    writer.flush()?;
    Ok(())
}
