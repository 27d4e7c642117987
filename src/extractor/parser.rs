//! HTML parser for extracting product metadata
//!
//! This module handles parsing product pages to extract:
//! - Page title (from `<title>`, OpenGraph, or structured data)
//! - OpenGraph and `product:` meta tags
//! - JSON-LD `Product` blocks (name, sku, brand, price, availability)
//! - Canonical link

use crate::storage::ProductFields;
use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

/// Extracted information from a product page
#[derive(Debug, Clone, Default)]
pub struct ParsedProduct {
    /// Field name to value
    pub fields: ProductFields,

    /// Whether a JSON-LD `Product` block was found
    pub structured: bool,
}

impl ParsedProduct {
    fn set(&mut self, name: &str, value: Option<String>) {
        if let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.fields
                .entry(name.to_string())
                .or_insert(Value::String(value));
        }
    }
}

/// Parses a product page
///
/// # Field Precedence
///
/// Structured data wins over meta tags, which win over the `<title>` tag.
/// A field is only set from the first source that provides it.
///
/// # Arguments
///
/// * `html` - The HTML content to parse
/// * `base_url` - The base URL for resolving relative links
///
/// # Returns
///
/// The recovered fields; empty if the page carries no product metadata
///
/// # Example
///
/// ```
/// use catalog_harvest::extractor::parse_product_page;
/// use url::Url;
///
/// let html = r#"<html><head><title>Desk Lamp</title></head></html>"#;
/// let base_url = Url::parse("https://example.com/p/1").unwrap();
/// let parsed = parse_product_page(html, &base_url);
/// assert_eq!(parsed.fields["title"], "Desk Lamp");
/// ```
pub fn parse_product_page(html: &str, base_url: &Url) -> ParsedProduct {
    let document = Html::parse_document(html);
    let mut parsed = ParsedProduct::default();

    if let Some(product) = extract_json_ld_product(&document) {
        parsed.structured = true;
        apply_json_ld(&mut parsed, &product);
    }

    parsed.set("title", meta_content(&document, "property", "og:title"));
    parsed.set(
        "description",
        meta_content(&document, "property", "og:description"),
    );
    parsed.set(
        "description",
        meta_content(&document, "name", "description"),
    );
    parsed.set(
        "price",
        meta_content(&document, "property", "product:price:amount"),
    );
    parsed.set(
        "currency",
        meta_content(&document, "property", "product:price:currency"),
    );
    parsed.set("brand", meta_content(&document, "property", "product:brand"));
    parsed.set(
        "availability",
        meta_content(&document, "property", "product:availability"),
    );
    parsed.set(
        "image",
        meta_content(&document, "property", "og:image").and_then(|src| resolve(&src, base_url)),
    );
    parsed.set("title", extract_title(&document));
    parsed.set(
        "canonical_url",
        extract_canonical(&document).and_then(|href| resolve(&href, base_url)),
    );

    parsed
}

/// Extracts the page title from the HTML document
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Reads `<meta {attr}="{key}" content="...">`
fn meta_content(document: &Html, attr: &str, key: &str) -> Option<String> {
    let selector = Selector::parse(&format!("meta[{}='{}'][content]", attr, key)).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("content"))
        .map(|content| content.to_string())
}

fn extract_canonical(document: &Html) -> Option<String> {
    let selector = Selector::parse("link[rel='canonical'][href]").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("href"))
        .map(|href| href.to_string())
}

/// Resolves a possibly relative href, keeping only http(s) URLs
fn resolve(href: &str, base_url: &Url) -> Option<String> {
    let absolute = base_url.join(href.trim()).ok()?;
    matches!(absolute.scheme(), "http" | "https").then(|| absolute.to_string())
}

/// Finds the first JSON-LD object typed `Product`
///
/// Handles top-level objects, arrays, and `@graph` containers.
fn extract_json_ld_product(document: &Html) -> Option<Value> {
    let selector = Selector::parse("script[type='application/ld+json']").ok()?;

    document.select(&selector).find_map(|element| {
        let raw = element.text().collect::<String>();
        let value: Value = serde_json::from_str(raw.trim()).ok()?;
        find_product(&value).cloned()
    })
}

fn find_product(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_product),
        Value::Object(map) => {
            if is_product_type(map.get("@type")) {
                return Some(value);
            }
            map.get("@graph").and_then(find_product)
        }
        _ => None,
    }
}

fn is_product_type(kind: Option<&Value>) -> bool {
    match kind {
        Some(Value::String(s)) => s == "Product",
        Some(Value::Array(kinds)) => kinds.iter().any(|k| k.as_str() == Some("Product")),
        _ => false,
    }
}

/// Renders a scalar JSON value as text
fn scalar(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn apply_json_ld(parsed: &mut ParsedProduct, product: &Value) {
    parsed.set("title", scalar(product.get("name")));
    parsed.set("description", scalar(product.get("description")));
    parsed.set("sku", scalar(product.get("sku")));
    parsed.set("gtin", scalar(product.get("gtin13")).or(scalar(product.get("gtin"))));

    // Brand is either a name or an object carrying one
    let brand = product.get("brand").and_then(|b| match b {
        Value::Object(_) => scalar(b.get("name")),
        other => scalar(Some(other)),
    });
    parsed.set("brand", brand);

    let image = match product.get("image") {
        Some(Value::Array(images)) => scalar(images.first()),
        other => scalar(other),
    };
    parsed.set("image", image);

    let offer = match product.get("offers") {
        Some(Value::Array(offers)) => offers.first(),
        other => other,
    };
    if let Some(offer) = offer {
        parsed.set(
            "price",
            scalar(offer.get("price")).or(scalar(offer.get("lowPrice"))),
        );
        parsed.set("currency", scalar(offer.get("priceCurrency")));
        parsed.set(
            "availability",
            scalar(offer.get("availability")).map(|a| {
                a.rsplit('/').next().unwrap_or(a.as_str()).to_string()
            }),
        );
    }
}
