//! Legacy content to Gutenberg blocks.
//!
//! Conversion routines are plain function pointers registered by shortcode
//! name or component type in a [`ConverterRegistry`]. Anything unregistered
//! is reported as an [`Anomaly`] and kept as raw HTML.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::block::{self, Block, ImageSpec};
use crate::html::{first_image_in, html_to_blocks_with};
use crate::mapper::Anomaly;
use crate::media::{ImportedMedia, MediaResolver};
use crate::shortcode::{Shortcode, parse_shortcodes, shortcode_names};
use crate::text::escape_html;

pub type ShortcodeConverter = fn(&Shortcode, &mut TransformContext<'_>) -> Result<Vec<Block>>;
pub type ComponentConverter =
    fn(&Map<String, Value>, &mut TransformContext<'_>) -> Result<Vec<Block>>;

#[derive(Debug, Clone, Copy)]
pub enum LegacyFragment<'a> {
    /// Classic post text mixing HTML and shortcodes.
    Shortcodes(&'a str),
    Html(&'a str),
    /// Component objects carrying a `type` key.
    Components(&'a [Value]),
    /// ACF flexible-content rows carrying an `acf_fc_layout` key.
    Layout(&'a [Value]),
}

/// Per-record state handed to every converter.
pub struct TransformContext<'a> {
    pub record_id: String,
    pub post_id: Option<i64>,
    pub dry_run: bool,
    media: Option<&'a mut dyn MediaResolver>,
    anomalies: Vec<Anomaly>,
}

impl<'a> TransformContext<'a> {
    pub fn new(record_id: impl Into<String>, post_id: Option<i64>, dry_run: bool) -> Self {
        Self {
            record_id: record_id.into(),
            post_id,
            dry_run,
            media: None,
            anomalies: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: &'a mut dyn MediaResolver) -> Self {
        self.media = Some(media);
        self
    }

    pub fn anomaly(&mut self, reason: impl Into<String>) {
        let anomaly = Anomaly::new(&self.record_id, reason);
        warn!(record_id = %anomaly.record_id, reason = %anomaly.reason, "content anomaly");
        self.anomalies.push(anomaly);
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn take_anomalies(&mut self) -> Vec<Anomaly> {
        std::mem::take(&mut self.anomalies)
    }

    /// Imports `url` when a resolver is attached. Failures keep the external URL.
    pub fn import_media(&mut self, url: &str) -> ImportedMedia {
        let fallback = ImportedMedia {
            attachment_id: None,
            url: url.trim().to_string(),
            reused: false,
        };
        let post_id = self.post_id;
        let Some(media) = self.media.as_deref_mut() else {
            return fallback;
        };
        match media.import(url, post_id) {
            Ok(imported) => imported,
            Err(error) => {
                self.anomaly(format!("media import failed for {url}: {error:#}"));
                fallback
            }
        }
    }

    pub fn attachment_url(&mut self, attachment_id: i64) -> Option<String> {
        let media = self.media.as_deref_mut()?;
        match media.attachment_url(attachment_id) {
            Ok(url) => url,
            Err(error) => {
                self.anomaly(format!("failed to look up attachment {attachment_id}: {error:#}"));
                None
            }
        }
    }

    fn resolve_image(&mut self, mut image: ImageSpec) -> ImageSpec {
        if image.id.is_some() {
            return image;
        }
        let imported = self.import_media(&image.url);
        image.id = imported.attachment_id;
        image.url = imported.url;
        image
    }
}

/// Result of rewriting shortcodes in place inside existing post content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextConversion {
    pub content: String,
    pub converted: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct ConverterRegistry {
    shortcodes: BTreeMap<String, ShortcodeConverter>,
    components: BTreeMap<String, ComponentConverter>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_shortcode("gallery", gallery_shortcode);
        registry.register_shortcode("caption", caption_shortcode);
        registry.register_shortcode("wp_caption", caption_shortcode);
        registry.register_shortcode("embed", embed_shortcode);
        registry.register_shortcode("youtube", embed_shortcode);
        registry.register_shortcode("video", embed_shortcode);
        registry.register_shortcode("pullquote", pullquote_shortcode);
        registry.register_shortcode("quote", pullquote_shortcode);
        registry.register_shortcode("audio", audio_shortcode);
        registry.register_shortcode("pdf", document_shortcode);
        registry.register_shortcode("document", document_shortcode);

        for kind in ["paragraph", "text", "text_block", "wysiwyg", "body"] {
            registry.register_component(kind, paragraph_component);
        }
        for kind in ["heading", "header", "subhead"] {
            registry.register_component(kind, heading_component);
        }
        for kind in ["image", "image_block", "photo"] {
            registry.register_component(kind, image_component);
        }
        for kind in ["gallery", "gallery_block", "slideshow"] {
            registry.register_component(kind, gallery_component);
        }
        for kind in ["quote", "blockquote", "pullquote", "quote_block"] {
            registry.register_component(kind, quote_component);
        }
        for kind in ["list", "list_block"] {
            registry.register_component(kind, list_component);
        }
        for kind in ["embed", "video", "oembed", "social_embed"] {
            registry.register_component(kind, embed_component);
        }
        for kind in ["html", "raw_html", "code_block"] {
            registry.register_component(kind, html_component);
        }
        for kind in ["divider", "separator", "hr"] {
            registry.register_component(kind, divider_component);
        }
        for kind in ["ad", "ad_slot", "newsletter", "newsletter_signup", "related", "related_posts"] {
            registry.register_component(kind, dropped_component);
        }
        registry
    }

    pub fn register_shortcode(&mut self, name: &str, converter: ShortcodeConverter) {
        self.shortcodes.insert(name.to_ascii_lowercase(), converter);
    }

    pub fn register_component(&mut self, kind: &str, converter: ComponentConverter) {
        self.components.insert(kind.to_ascii_lowercase(), converter);
    }

    pub fn has_shortcode(&self, name: &str) -> bool {
        self.shortcodes.contains_key(&name.to_ascii_lowercase())
    }

    pub fn shortcode_names(&self) -> Vec<&str> {
        self.shortcodes.keys().map(String::as_str).collect()
    }

    pub fn transform(&self, fragment: LegacyFragment<'_>, context: &mut TransformContext<'_>) -> Vec<Block> {
        match fragment {
            LegacyFragment::Shortcodes(text) => self.text_to_blocks(text, context),
            LegacyFragment::Html(html) => html_blocks(html, context),
            LegacyFragment::Components(items) => self.convert_components(items, "type", context),
            LegacyFragment::Layout(rows) => self.convert_components(rows, "acf_fc_layout", context),
        }
    }

    /// Replaces registered shortcodes (limited to `only` when given) with block
    /// markup, leaving every byte outside the replaced spans untouched.
    pub fn convert_shortcodes_in_text(
        &self,
        text: &str,
        only: Option<&[String]>,
        context: &mut TransformContext<'_>,
    ) -> TextConversion {
        let wanted = |name: &str| {
            self.shortcodes.contains_key(name)
                && only.is_none_or(|names| names.iter().any(|wanted| wanted.eq_ignore_ascii_case(name)))
        };
        let mut content = String::with_capacity(text.len());
        let mut cursor = 0;
        let mut converted = 0;
        let mut failed = 0;

        for shortcode in parse_shortcodes(text, wanted) {
            content.push_str(&text[cursor..shortcode.span.start]);
            let original = &text[shortcode.span.clone()];
            match self.convert_shortcode(&shortcode, context) {
                Ok(blocks) => {
                    content.push_str(&block::serialize_blocks(&blocks));
                    converted += 1;
                }
                Err(error) => {
                    context.anomaly(format!("[{}] left unconverted: {error:#}", shortcode.name));
                    content.push_str(original);
                    failed += 1;
                }
            }
            cursor = shortcode.span.end;
        }
        content.push_str(&text[cursor..]);

        if only.is_none() {
            self.report_unknown_shortcodes(text, context);
        }
        TextConversion {
            content,
            converted,
            failed,
        }
    }

    fn convert_shortcode(
        &self,
        shortcode: &Shortcode,
        context: &mut TransformContext<'_>,
    ) -> Result<Vec<Block>> {
        match self.shortcodes.get(&shortcode.name) {
            Some(converter) => converter(shortcode, context),
            None => bail!("no converter registered for [{}]", shortcode.name),
        }
    }

    fn text_to_blocks(&self, text: &str, context: &mut TransformContext<'_>) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut cursor = 0;
        for shortcode in parse_shortcodes(text, |name| self.shortcodes.contains_key(name)) {
            blocks.extend(html_blocks(&text[cursor..shortcode.span.start], context));
            match self.convert_shortcode(&shortcode, context) {
                Ok(converted) => blocks.extend(converted),
                Err(error) => {
                    context.anomaly(format!("[{}] kept as HTML: {error:#}", shortcode.name));
                    blocks.push(block::html(&text[shortcode.span.clone()]));
                }
            }
            cursor = shortcode.span.end;
        }
        blocks.extend(html_blocks(&text[cursor..], context));
        self.report_unknown_shortcodes(text, context);
        blocks
    }

    fn report_unknown_shortcodes(&self, text: &str, context: &mut TransformContext<'_>) {
        for name in shortcode_names(text) {
            if !self.shortcodes.contains_key(&name) && name.starts_with(|ch: char| ch.is_ascii_alphabetic()) {
                context.anomaly(format!("unknown shortcode [{name}] passed through"));
            }
        }
    }

    fn convert_components(
        &self,
        items: &[Value],
        type_key: &str,
        context: &mut TransformContext<'_>,
    ) -> Vec<Block> {
        let mut blocks = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let Some(object) = item.as_object() else {
                context.anomaly(format!("component #{index} is not an object"));
                continue;
            };
            let kind = object
                .get(type_key)
                .or_else(|| object.get("type"))
                .and_then(Value::as_str)
                .map(|kind| kind.trim().to_ascii_lowercase())
                .unwrap_or_default();
            match self.components.get(&kind) {
                Some(converter) => match converter(object, context) {
                    Ok(converted) => blocks.extend(converted),
                    Err(error) => {
                        context.anomaly(format!("component {kind:?} kept as HTML: {error:#}"));
                        blocks.push(raw_component(object));
                    }
                },
                None => {
                    context.anomaly(format!("unknown component type {kind:?} passed through as HTML"));
                    blocks.push(raw_component(object));
                }
            }
        }
        blocks
    }
}

fn html_blocks(html: &str, context: &mut TransformContext<'_>) -> Vec<Block> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    html_to_blocks_with(html, &mut |image: ImageSpec| context.resolve_image(image))
}

fn raw_component(object: &Map<String, Value>) -> Block {
    match string_field(object, &["html", "content"]) {
        Some(html) => block::html(&html),
        None => {
            let json = serde_json::to_string_pretty(object).unwrap_or_default();
            block::html(&format!(
                "<pre class=\"presstool-unconverted\">{}</pre>",
                escape_html(&json)
            ))
        }
    }
}

fn gallery_shortcode(shortcode: &Shortcode, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let raw_ids = shortcode
        .attrs
        .get("ids")
        .or_else(|| shortcode.attrs.get("include"))
        .unwrap_or_default();
    let mut ids = Vec::new();
    for token in raw_ids.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<i64>() {
            Ok(id) if id > 0 => ids.push(id),
            _ => context.anomaly(format!("gallery id {token:?} is not an attachment id")),
        }
    }
    if ids.is_empty() {
        bail!("gallery has no attachment ids");
    }

    let images = ids
        .iter()
        .map(|id| ImageSpec {
            id: Some(*id),
            url: context
                .attachment_url(*id)
                .unwrap_or_else(|| format!("/?attachment_id={id}")),
            ..ImageSpec::default()
        })
        .collect::<Vec<_>>();
    let columns = shortcode
        .attrs
        .get("columns")
        .and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|value| (1..=8).contains(value));
    Ok(vec![block::gallery(&images, columns)])
}

fn caption_shortcode(shortcode: &Shortcode, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let content = shortcode.content.as_deref().unwrap_or_default();
    let Some(mut image) = first_image_in(content) else {
        bail!("caption has no image");
    };
    if image.id.is_none() {
        image.id = shortcode
            .attrs
            .get("id")
            .and_then(|id| id.trim().trim_start_matches("attachment_").parse::<i64>().ok());
    }
    image.caption = shortcode
        .attrs
        .get("caption")
        .map(str::to_string)
        .or_else(|| caption_text(content));
    Ok(vec![block::image(&context.resolve_image(image))])
}

/// Text following the image (and any wrapping link) inside a caption shortcode.
fn caption_text(content: &str) -> Option<String> {
    let image_start = content.find("<img")?;
    let image_end = image_start + content[image_start..].find('>')? + 1;
    let mut rest = content[image_end..].trim_start();
    if let Some(after_link) = rest.strip_prefix("</a>") {
        rest = after_link;
    }
    let text = rest.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn embed_shortcode(shortcode: &Shortcode, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let url = shortcode
        .content
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            ["url", "src", "mp4", "href"]
                .iter()
                .find_map(|key| shortcode.attrs.get(key))
                .map(str::to_string)
        })
        .or_else(|| {
            shortcode
                .attrs
                .positional(0)
                .filter(|value| value.starts_with("http"))
                .map(str::to_string)
        })
        .or_else(|| {
            (shortcode.name == "youtube")
                .then(|| shortcode.attrs.get("id").or_else(|| shortcode.attrs.positional(0)))
                .flatten()
                .map(|id| format!("https://www.youtube.com/watch?v={}", id.trim()))
        });
    let Some(url) = url else {
        bail!("[{}] has no URL", shortcode.name);
    };
    let provider = (shortcode.name == "youtube").then_some("youtube");
    Ok(vec![block::embed(url.trim(), provider)])
}

fn pullquote_shortcode(shortcode: &Shortcode, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let text = shortcode
        .content
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| shortcode.attrs.get("text"));
    let Some(text) = text else {
        bail!("[{}] has no quote text", shortcode.name);
    };
    let citation = ["cite", "author", "by", "source"]
        .iter()
        .find_map(|key| shortcode.attrs.get(key));
    Ok(vec![block::pullquote(text, citation)])
}

fn audio_shortcode(shortcode: &Shortcode, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(src) = ["src", "mp3", "m4a", "ogg", "wav"]
        .iter()
        .find_map(|key| shortcode.attrs.get(key))
        .map(str::to_string)
        .or_else(|| shortcode.content.clone().filter(|value| !value.trim().is_empty()))
    else {
        bail!("[audio] has no source");
    };
    let imported = context.import_media(&src);
    Ok(vec![block::audio(imported.attachment_id, &imported.url)])
}

fn document_shortcode(shortcode: &Shortcode, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(href) = ["url", "src", "href", "file"]
        .iter()
        .find_map(|key| shortcode.attrs.get(key))
        .or_else(|| shortcode.attrs.positional(0))
        .map(str::to_string)
        .or_else(|| shortcode.content.clone().filter(|value| !value.trim().is_empty()))
    else {
        bail!("[{}] has no file URL", shortcode.name);
    };
    let label = shortcode
        .attrs
        .get("title")
        .map(str::to_string)
        .unwrap_or_else(|| {
            href.split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit('/').next())
                .unwrap_or("Download")
                .to_string()
        });
    let imported = context.import_media(href.trim());
    Ok(vec![block::file(imported.attachment_id, &imported.url, &label)])
}

fn paragraph_component(object: &Map<String, Value>, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(text) = string_field(object, &["text", "html", "content", "body", "value"]) else {
        bail!("paragraph has no text");
    };
    Ok(html_blocks(&text, context))
}

fn heading_component(object: &Map<String, Value>, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(text) = string_field(object, &["text", "title", "content", "value"]) else {
        bail!("heading has no text");
    };
    let level = string_field(object, &["level", "size"])
        .and_then(|value| value.trim().trim_start_matches(['h', 'H']).parse::<u8>().ok())
        .unwrap_or(2);
    Ok(vec![block::heading(level, text.trim())])
}

fn image_component(object: &Map<String, Value>, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let image = component_image(object, context)?;
    Ok(vec![block::image(&image)])
}

fn component_image(object: &Map<String, Value>, context: &mut TransformContext<'_>) -> Result<ImageSpec> {
    let mut caption = string_field(object, &["caption", "description"]);
    if let Some(credit) = string_field(object, &["credit", "photographer", "byline"]) {
        caption = Some(match caption {
            Some(text) => format!("{text} ({credit})"),
            None => credit,
        });
    }
    let alt = string_field(object, &["alt", "alt_text"]).unwrap_or_default();

    if let Some(id) = int_field(object, &["id", "attachment_id", "image"]) {
        let url = context
            .attachment_url(id)
            .unwrap_or_else(|| format!("/?attachment_id={id}"));
        return Ok(ImageSpec {
            id: Some(id),
            url,
            alt,
            caption,
        });
    }
    let Some(url) = string_field(object, &["url", "src", "image_url", "image"]) else {
        bail!("image has neither an attachment id nor a URL");
    };
    let imported = context.import_media(&url);
    Ok(ImageSpec {
        id: imported.attachment_id,
        url: imported.url,
        alt,
        caption,
    })
}

fn gallery_component(object: &Map<String, Value>, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(items) = object
        .get("images")
        .or_else(|| object.get("items"))
        .or_else(|| object.get("slides"))
        .and_then(Value::as_array)
    else {
        bail!("gallery has no images list");
    };
    let mut images = Vec::new();
    for item in items {
        let image = match item {
            Value::String(url) => {
                let imported = context.import_media(url);
                Ok(ImageSpec {
                    id: imported.attachment_id,
                    url: imported.url,
                    ..ImageSpec::default()
                })
            }
            Value::Number(number) => match number.as_i64() {
                Some(id) => Ok(ImageSpec {
                    id: Some(id),
                    url: context
                        .attachment_url(id)
                        .unwrap_or_else(|| format!("/?attachment_id={id}")),
                    ..ImageSpec::default()
                }),
                None => Err(anyhow::anyhow!("gallery item {number} is not an id")),
            },
            Value::Object(image) => component_image(image, context),
            other => Err(anyhow::anyhow!("unsupported gallery item {other}")),
        };
        match image {
            Ok(image) => images.push(image),
            Err(error) => context.anomaly(format!("gallery item skipped: {error:#}")),
        }
    }
    if images.is_empty() {
        bail!("gallery has no usable images");
    }
    Ok(vec![block::gallery(&images, None)])
}

fn quote_component(object: &Map<String, Value>, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(text) = string_field(object, &["text", "quote", "content", "value"]) else {
        bail!("quote has no text");
    };
    let citation = string_field(object, &["cite", "citation", "attribution", "author", "source"]);
    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    Ok(vec![block::quote(&paragraphs, citation.as_deref())])
}

fn list_component(object: &Map<String, Value>, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(items) = object.get("items").and_then(Value::as_array) else {
        bail!("list has no items");
    };
    let items = items
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(text.trim().to_string()),
            Value::Object(entry) => string_field(entry, &["text", "content", "value"]),
            _ => None,
        })
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();
    if items.is_empty() {
        bail!("list has no text items");
    }
    let ordered = object
        .get("ordered")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| {
            string_field(object, &["style", "list_type"])
                .map(|style| matches!(style.as_str(), "ordered" | "numbered" | "ol"))
                .unwrap_or(false)
        });
    Ok(vec![block::list(ordered, &items)])
}

fn embed_component(object: &Map<String, Value>, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(url) = string_field(object, &["url", "src", "embed_url", "link"]) else {
        bail!("embed has no URL");
    };
    Ok(vec![block::embed(url.trim(), None)])
}

fn html_component(object: &Map<String, Value>, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    let Some(html) = string_field(object, &["html", "content", "code", "value"]) else {
        bail!("html component is empty");
    };
    Ok(vec![block::html(&html)])
}

fn divider_component(_object: &Map<String, Value>, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    Ok(vec![block::separator()])
}

fn dropped_component(object: &Map<String, Value>, context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
    debug!(
        record_id = %context.record_id,
        kind = object.get("type").and_then(serde_json::Value::as_str).unwrap_or("layout"),
        "dropping component"
    );
    Ok(Vec::new())
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn int_field(object: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct FixedMedia {
        imports: Vec<String>,
    }

    impl MediaResolver for FixedMedia {
        fn import(&mut self, url: &str, _parent_post_id: Option<i64>) -> Result<ImportedMedia> {
            if url.contains("broken") {
                bail!("HTTP 500");
            }
            self.imports.push(url.to_string());
            Ok(ImportedMedia {
                attachment_id: Some(100 + i64::try_from(self.imports.len()).expect("len")),
                url: format!("/wp-content/uploads/{}", self.imports.len()),
                reused: false,
            })
        }

        fn attachment_url(&mut self, attachment_id: i64) -> Result<Option<String>> {
            Ok(Some(format!("/wp-content/uploads/a{attachment_id}.jpg")))
        }
    }

    fn context<'a>() -> TransformContext<'a> {
        TransformContext::new("legacy-1", Some(10), false)
    }

    #[test]
    fn gallery_in_text_keeps_ids_and_surroundings() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let text = "Intro text.\n[gallery ids=1,2,3]\nOutro [[gallery ids=9]] text.";
        let result = registry.convert_shortcodes_in_text(text, None, &mut context);
        assert_eq!(result.converted, 1);
        assert!(result.content.starts_with("Intro text.\n<!-- wp:gallery {\"ids\":[1,2,3],"));
        assert!(result.content.ends_with("<!-- /wp:gallery -->\nOutro [[gallery ids=9]] text."));
        assert!(context.anomalies().is_empty());
    }

    #[test]
    fn gallery_uses_resolved_attachment_urls() {
        let registry = ConverterRegistry::with_builtins();
        let mut media = FixedMedia { imports: Vec::new() };
        let mut context = context().with_media(&mut media);
        let result = registry.convert_shortcodes_in_text("[gallery ids=\"4, 5\"]", None, &mut context);
        assert!(result.content.contains("/wp-content/uploads/a4.jpg"));
        assert!(result.content.contains("/wp-content/uploads/a5.jpg"));
    }

    #[test]
    fn only_filter_limits_conversion() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let text = "[caption id=\"attachment_3\"]<img src=\"a.jpg\"> Cap[/caption][gallery ids=2]";
        let only = vec!["gallery".to_string()];
        let result = registry.convert_shortcodes_in_text(text, Some(&only), &mut context);
        assert_eq!(result.converted, 1);
        assert!(result.content.starts_with("[caption id=\"attachment_3\"]"));
    }

    #[test]
    fn broken_gallery_is_left_and_reported() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let result = registry.convert_shortcodes_in_text("a [gallery] b", None, &mut context);
        assert_eq!(result.content, "a [gallery] b");
        assert_eq!(result.failed, 1);
        assert_eq!(context.anomalies().len(), 1);
    }

    #[test]
    fn unknown_shortcodes_pass_through_with_anomaly() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let result = registry.convert_shortcodes_in_text("x [tweet id=1] y", None, &mut context);
        assert_eq!(result.content, "x [tweet id=1] y");
        assert!(context.anomalies()[0].reason.contains("[tweet]"));
    }

    #[test]
    fn caption_becomes_image_with_caption() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let blocks = registry.transform(
            LegacyFragment::Shortcodes(
                "<p>Lead</p>[caption id=\"attachment_7\" align=\"alignnone\"]<a href=\"/x\"><img src=\"https://legacy.example/p.jpg\" alt=\"P\"></a> Mayor speaks[/caption]",
            ),
            &mut context,
        );
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].name(), Some("core/image"));
        assert_eq!(blocks[1].attrs.get("id"), Some(&json!(7)));
        assert!(blocks[1].inner_html().contains("Mayor speaks"));
    }

    #[test]
    fn html_images_are_imported_and_failures_degrade() {
        let registry = ConverterRegistry::with_builtins();
        let mut media = FixedMedia { imports: Vec::new() };
        let mut context = context().with_media(&mut media);
        let blocks = registry.transform(
            LegacyFragment::Html(
                "<img src=\"https://legacy.example/ok.jpg\"><img src=\"https://legacy.example/broken.jpg\">",
            ),
            &mut context,
        );
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].inner_html().contains("/wp-content/uploads/1"));
        assert!(blocks[1].inner_html().contains("https://legacy.example/broken.jpg"));
        assert_eq!(context.anomalies().len(), 1);
    }

    #[test]
    fn components_dispatch_and_drop() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let components = vec![
            json!({"type": "heading", "text": "Budget", "level": "h3"}),
            json!({"type": "paragraph", "text": "<p>Council met.</p>"}),
            json!({"type": "ad", "slot": "top"}),
            json!({"type": "list", "items": ["a", {"text": "b"}], "style": "ordered"}),
            json!({"type": "newsletter"}),
            json!({"type": "divider"}),
            json!({"type": "poll", "question": "Yes?"}),
        ];
        let blocks = registry.transform(LegacyFragment::Components(&components), &mut context);
        let names = blocks.iter().filter_map(Block::name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["core/heading", "core/paragraph", "core/list", "core/separator", "core/html"]
        );
        assert_eq!(blocks[0].attrs.get("level"), Some(&json!(3)));
        assert!(blocks[4].inner_html().contains("presstool-unconverted"));
        assert_eq!(context.anomalies().len(), 1);
    }

    #[test]
    fn dropped_only_components_yield_no_blocks() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let components = vec![json!({"type": "related"}), json!({"type": "ad"})];
        assert!(
            registry
                .transform(LegacyFragment::Components(&components), &mut context)
                .is_empty()
        );
    }

    #[test]
    fn acf_layout_rows_use_layout_key() {
        let registry = ConverterRegistry::with_builtins();
        let mut media = FixedMedia { imports: Vec::new() };
        let mut context = context().with_media(&mut media);
        let rows = vec![
            json!({"acf_fc_layout": "text_block", "text": "Body copy"}),
            json!({"acf_fc_layout": "image_block", "image": 55, "caption": "Photo", "credit": "AP"}),
            json!({"acf_fc_layout": "gallery_block", "images": [56, "https://legacy.example/g.jpg"]}),
        ];
        let blocks = registry.transform(LegacyFragment::Layout(&rows), &mut context);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].attrs.get("id"), Some(&json!(55)));
        assert!(blocks[1].inner_html().contains("Photo (AP)"));
        assert_eq!(blocks[2].attrs.get("ids"), Some(&json!([56, 101])));
    }

    #[test]
    fn custom_converters_can_be_registered() {
        fn byline_box(shortcode: &Shortcode, _context: &mut TransformContext<'_>) -> Result<Vec<Block>> {
            Ok(vec![block::paragraph(shortcode.attrs.get("name").unwrap_or_default())])
        }
        let mut registry = ConverterRegistry::new();
        registry.register_shortcode("BylineBox", byline_box);
        assert!(registry.has_shortcode("bylinebox"));
        let mut context = context();
        let result = registry.convert_shortcodes_in_text("[bylinebox name=Ann]", None, &mut context);
        assert_eq!(result.content, "<!-- wp:paragraph --><p>Ann</p><!-- /wp:paragraph -->");
    }

    #[test]
    fn embeds_resolve_urls_from_content_or_ids() {
        let registry = ConverterRegistry::with_builtins();
        let mut context = context();
        let result = registry.convert_shortcodes_in_text(
            "[embed]https://vimeo.com/1[/embed][youtube id=abc]",
            None,
            &mut context,
        );
        assert_eq!(result.converted, 2);
        assert!(result.content.contains("\"providerNameSlug\":\"vimeo\""));
        assert!(result.content.contains("https://www.youtube.com/watch?v=abc"));
    }
}
