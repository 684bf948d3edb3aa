//! Gutenberg block values and their comment-delimited serialization.
//!
//! A [`Block`] mirrors the parsed block shape WordPress works with: a name,
//! JSON attributes, inner blocks, and `inner_content`, which interleaves raw
//! HTML with the positions where inner blocks are spliced in.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::text::escape_html;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InnerContent {
    Html(String),
    InnerBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    /// `None` is a freeform (classic) chunk serialized as bare HTML.
    pub name: Option<String>,
    pub attrs: Map<String, Value>,
    pub inner_blocks: Vec<Block>,
    pub inner_content: Vec<InnerContent>,
}

impl Block {
    pub fn leaf(name: &str, attrs: Map<String, Value>, html: impl Into<String>) -> Self {
        let html = html.into();
        Self {
            name: Some(name.to_string()),
            attrs,
            inner_blocks: Vec::new(),
            inner_content: if html.is_empty() {
                Vec::new()
            } else {
                vec![InnerContent::Html(html)]
            },
        }
    }

    /// Wraps `inner` between `open` and `close`, separating inner blocks with newlines.
    pub fn container(
        name: &str,
        attrs: Map<String, Value>,
        open: &str,
        inner: Vec<Block>,
        close: &str,
    ) -> Self {
        let mut inner_content = vec![InnerContent::Html(open.to_string())];
        for (index, _) in inner.iter().enumerate() {
            if index > 0 {
                inner_content.push(InnerContent::Html("\n".to_string()));
            }
            inner_content.push(InnerContent::InnerBlock);
        }
        inner_content.push(InnerContent::Html(close.to_string()));
        Self {
            name: Some(name.to_string()),
            attrs,
            inner_blocks: inner,
            inner_content,
        }
    }

    pub fn freeform(html: impl Into<String>) -> Self {
        Self {
            name: None,
            attrs: Map::new(),
            inner_blocks: Vec::new(),
            inner_content: vec![InnerContent::Html(html.into())],
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// HTML of this block without its inner blocks.
    pub fn inner_html(&self) -> String {
        self.inner_content
            .iter()
            .filter_map(|part| match part {
                InnerContent::Html(html) => Some(html.as_str()),
                InnerContent::InnerBlock => None,
            })
            .collect()
    }

    pub fn serialize(&self) -> String {
        let mut output = String::new();
        self.serialize_into(&mut output);
        output
    }

    fn serialize_into(&self, output: &mut String) {
        let Some(name) = self.name.as_deref() else {
            output.push_str(&self.inner_html());
            return;
        };
        let comment_name = name.strip_prefix("core/").unwrap_or(name);
        let attrs = serialize_attributes(&self.attrs);

        output.push_str("<!-- wp:");
        output.push_str(comment_name);
        if let Some(attrs) = &attrs {
            output.push(' ');
            output.push_str(attrs);
        }
        if self.inner_content.is_empty() {
            output.push_str(" /-->");
            return;
        }
        output.push_str(" -->");

        let mut inner_blocks = self.inner_blocks.iter();
        for part in &self.inner_content {
            match part {
                InnerContent::Html(html) => output.push_str(html),
                InnerContent::InnerBlock => {
                    if let Some(block) = inner_blocks.next() {
                        block.serialize_into(output);
                    }
                }
            }
        }

        output.push_str("<!-- /wp:");
        output.push_str(comment_name);
        output.push_str(" -->");
    }
}

/// Serialized blocks separated by blank lines, as the block editor saves them.
pub fn serialize_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(Block::serialize)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// JSON attributes escaped so they cannot terminate the surrounding HTML comment.
pub fn serialize_attributes(attrs: &Map<String, Value>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let raw = Value::Object(attrs.clone()).to_string();
    Some(
        raw.replace("--", "\\u002d\\u002d")
            .replace('<', "\\u003c")
            .replace('>', "\\u003e")
            .replace('&', "\\u0026")
            .replace("\\\"", "\\u0022"),
    )
}

fn attrs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn paragraph(html: &str) -> Block {
    Block::leaf("core/paragraph", Map::new(), format!("<p>{html}</p>"))
}

pub fn heading(level: u8, html: &str) -> Block {
    let level = level.clamp(1, 6);
    let attributes = if level == 2 {
        Map::new()
    } else {
        attrs(json!({ "level": level }))
    };
    Block::leaf(
        "core/heading",
        attributes,
        format!("<h{level} class=\"wp-block-heading\">{html}</h{level}>"),
    )
}

pub fn list(ordered: bool, items: &[String]) -> Block {
    let inner = items
        .iter()
        .map(|item| Block::leaf("core/list-item", Map::new(), format!("<li>{item}</li>")))
        .collect::<Vec<_>>();
    let (attributes, tag) = if ordered {
        (attrs(json!({ "ordered": true })), "ol")
    } else {
        (Map::new(), "ul")
    };
    Block::container(
        "core/list",
        attributes,
        &format!("<{tag} class=\"wp-block-list\">"),
        inner,
        &format!("</{tag}>"),
    )
}

pub fn quote(paragraphs: &[String], citation: Option<&str>) -> Block {
    let inner = paragraphs
        .iter()
        .map(|text| paragraph(text))
        .collect::<Vec<_>>();
    let close = match citation {
        Some(cite) if !cite.trim().is_empty() => format!("<cite>{cite}</cite></blockquote>"),
        _ => "</blockquote>".to_string(),
    };
    Block::container(
        "core/quote",
        Map::new(),
        "<blockquote class=\"wp-block-quote\">",
        inner,
        &close,
    )
}

pub fn pullquote(text: &str, citation: Option<&str>) -> Block {
    let cite = match citation {
        Some(cite) if !cite.trim().is_empty() => format!("<cite>{cite}</cite>"),
        _ => String::new(),
    };
    Block::leaf(
        "core/pullquote",
        Map::new(),
        format!("<figure class=\"wp-block-pullquote\"><blockquote><p>{text}</p>{cite}</blockquote></figure>"),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageSpec {
    pub id: Option<i64>,
    pub url: String,
    pub alt: String,
    pub caption: Option<String>,
}

pub fn image(spec: &ImageSpec) -> Block {
    let mut attributes = Map::new();
    if let Some(id) = spec.id {
        attributes.insert("id".to_string(), json!(id));
    }
    attributes.insert("sizeSlug".to_string(), json!("large"));
    attributes.insert("linkDestination".to_string(), json!("none"));

    let class = spec
        .id
        .map(|id| format!(" class=\"wp-image-{id}\""))
        .unwrap_or_default();
    let caption = match spec.caption.as_deref() {
        Some(caption) if !caption.trim().is_empty() => {
            format!("<figcaption class=\"wp-element-caption\">{caption}</figcaption>")
        }
        _ => String::new(),
    };
    Block::leaf(
        "core/image",
        attributes,
        format!(
            "<figure class=\"wp-block-image size-large\"><img src=\"{}\" alt=\"{}\"{class}/>{caption}</figure>",
            escape_html(&spec.url),
            escape_html(&spec.alt)
        ),
    )
}

/// Gallery with nested image blocks; `ids` keeps the given attachment order.
pub fn gallery(images: &[ImageSpec], columns: Option<u32>) -> Block {
    let ids = images.iter().filter_map(|image| image.id).collect::<Vec<_>>();
    let mut attributes = Map::new();
    if !ids.is_empty() {
        attributes.insert("ids".to_string(), json!(ids));
    }
    if let Some(columns) = columns {
        attributes.insert("columns".to_string(), json!(columns));
    }
    attributes.insert("linkTo".to_string(), json!("none"));

    let columns_class = columns
        .map(|value| format!("columns-{value}"))
        .unwrap_or_else(|| "columns-default".to_string());
    let inner = images.iter().map(image).collect::<Vec<_>>();
    Block::container(
        "core/gallery",
        attributes,
        &format!("<figure class=\"wp-block-gallery has-nested-images {columns_class} is-cropped\">"),
        inner,
        "</figure>",
    )
}

pub fn embed(url: &str, provider: Option<&str>) -> Block {
    let provider = provider.map(str::to_string).or_else(|| embed_provider(url));
    let kind = match provider.as_deref() {
        Some("youtube") | Some("vimeo") => "video",
        _ => "rich",
    };
    let mut attributes = Map::new();
    attributes.insert("url".to_string(), json!(url));
    attributes.insert("type".to_string(), json!(kind));
    let mut class = format!("wp-block-embed is-type-{kind}");
    if let Some(provider) = provider.as_deref() {
        attributes.insert("providerNameSlug".to_string(), json!(provider));
        class.push_str(&format!(" is-provider-{provider} wp-block-embed-{provider}"));
    }
    Block::leaf(
        "core/embed",
        attributes,
        format!(
            "<figure class=\"{class}\"><div class=\"wp-block-embed__wrapper\">\n{}\n</div></figure>",
            escape_html(url)
        ),
    )
}

pub fn audio(id: Option<i64>, src: &str) -> Block {
    let mut attributes = Map::new();
    if let Some(id) = id {
        attributes.insert("id".to_string(), json!(id));
    }
    Block::leaf(
        "core/audio",
        attributes,
        format!(
            "<figure class=\"wp-block-audio\"><audio controls src=\"{}\"></audio></figure>",
            escape_html(src)
        ),
    )
}

pub fn file(id: Option<i64>, href: &str, label: &str) -> Block {
    let mut attributes = Map::new();
    if let Some(id) = id {
        attributes.insert("id".to_string(), json!(id));
    }
    attributes.insert("href".to_string(), json!(href));
    let href = escape_html(href);
    Block::leaf(
        "core/file",
        attributes,
        format!(
            "<div class=\"wp-block-file\"><a href=\"{href}\">{}</a><a href=\"{href}\" class=\"wp-block-file__button wp-element-button\" download>Download</a></div>",
            escape_html(label)
        ),
    )
}

pub fn html(raw: &str) -> Block {
    Block::leaf("core/html", Map::new(), raw.to_string())
}

pub fn separator() -> Block {
    Block::leaf(
        "core/separator",
        Map::new(),
        "<hr class=\"wp-block-separator has-alpha-channel-opacity\"/>",
    )
}

pub fn embed_provider(url: &str) -> Option<String> {
    let lower = url.to_ascii_lowercase();
    let provider = if lower.contains("youtube.com") || lower.contains("youtu.be") {
        "youtube"
    } else if lower.contains("vimeo.com") {
        "vimeo"
    } else if lower.contains("twitter.com") || lower.contains("x.com/") {
        "twitter"
    } else if lower.contains("instagram.com") {
        "instagram"
    } else if lower.contains("facebook.com") {
        "facebook"
    } else if lower.contains("soundcloud.com") {
        "soundcloud"
    } else {
        return None;
    };
    Some(provider.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_serializes_without_attributes() {
        assert_eq!(
            paragraph("Hello").serialize(),
            "<!-- wp:paragraph --><p>Hello</p><!-- /wp:paragraph -->"
        );
    }

    #[test]
    fn void_block_uses_self_closing_comment() {
        let block = Block::leaf("core/latest-posts", attrs(json!({ "postsToShow": 3 })), "");
        assert_eq!(block.serialize(), "<!-- wp:latest-posts {\"postsToShow\":3} /-->");
    }

    #[test]
    fn non_core_namespace_is_kept() {
        let block = Block::leaf("newspack/byline", Map::new(), "<p>x</p>");
        assert!(block.serialize().starts_with("<!-- wp:newspack/byline -->"));
    }

    #[test]
    fn attributes_cannot_close_the_comment() {
        let serialized =
            serialize_attributes(&attrs(json!({ "caption": "a --> <b>&\"" }))).expect("attrs");
        assert!(!serialized.contains("--"));
        assert!(!serialized.contains('<'));
        assert!(!serialized.contains('&'));
        assert!(serialized.contains("\\u0022"));
    }

    #[test]
    fn gallery_keeps_id_order_and_nests_images() {
        let images = [3, 1, 2]
            .iter()
            .map(|id| ImageSpec {
                id: Some(*id),
                url: format!("https://cdn.example/{id}.jpg"),
                ..ImageSpec::default()
            })
            .collect::<Vec<_>>();
        let block = gallery(&images, None);
        assert_eq!(block.attrs.get("ids"), Some(&json!([3, 1, 2])));
        let serialized = block.serialize();
        assert!(serialized.starts_with("<!-- wp:gallery {\"ids\":[3,1,2],\"linkTo\":\"none\"} -->"));
        let first = serialized.find("wp-image-3").expect("image 3");
        let second = serialized.find("wp-image-1").expect("image 1");
        let third = serialized.find("wp-image-2").expect("image 2");
        assert!(first < second && second < third);
        assert!(serialized.ends_with("</figure><!-- /wp:gallery -->"));
    }

    #[test]
    fn inner_html_skips_inner_blocks() {
        let block = list(false, &["one".to_string(), "two".to_string()]);
        assert_eq!(block.inner_html(), "<ul class=\"wp-block-list\">\n</ul>");
        assert_eq!(block.inner_blocks.len(), 2);
    }

    #[test]
    fn heading_level_two_is_default() {
        assert!(heading(2, "Title").attrs.is_empty());
        assert_eq!(heading(4, "Sub").attrs.get("level"), Some(&json!(4)));
    }

    #[test]
    fn embed_detects_provider() {
        let block = embed("https://www.youtube.com/watch?v=abc", None);
        assert_eq!(block.attrs.get("providerNameSlug"), Some(&json!("youtube")));
        assert_eq!(block.attrs.get("type"), Some(&json!("video")));
    }

    #[test]
    fn freeform_is_bare_html() {
        assert_eq!(Block::freeform("<p>legacy</p>").serialize(), "<p>legacy</p>");
        assert_eq!(serialize_blocks(&[separator(), paragraph("x")]).matches("\n\n").count(), 1);
    }
}
