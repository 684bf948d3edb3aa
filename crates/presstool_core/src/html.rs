//! Splits legacy HTML fragments into core blocks, one per top-level element.

use scraper::{ElementRef, Html};

use crate::block::{self, Block, ImageSpec};
use crate::text::escape_html;

const INLINE_TAGS: &[&str] = &[
    "a", "abbr", "b", "br", "code", "em", "i", "mark", "s", "small", "span", "strong", "sub",
    "sup", "u",
];

pub fn html_to_blocks(html: &str) -> Vec<Block> {
    html_to_blocks_with(html, &mut |image: ImageSpec| image)
}

/// Like [`html_to_blocks`], passing every image through `resolve_image` first
/// so callers can swap legacy URLs for imported attachments.
pub fn html_to_blocks_with(
    html: &str,
    resolve_image: &mut dyn FnMut(ImageSpec) -> ImageSpec,
) -> Vec<Block> {
    let fragment = Html::parse_fragment(html);
    let mut blocks = Vec::new();
    let mut inline = String::new();

    for node in fragment.root_element().children() {
        if let Some(text) = node.value().as_text() {
            inline.push_str(&escape_html(text));
            continue;
        }
        let Some(element) = ElementRef::wrap(node) else {
            continue;
        };
        let tag = element.value().name();
        if INLINE_TAGS.contains(&tag) {
            inline.push_str(&element.html());
            continue;
        }
        flush_inline(&mut inline, &mut blocks);
        blocks.extend(element_to_blocks(element, resolve_image));
    }
    flush_inline(&mut inline, &mut blocks);
    blocks
}

/// First `<img>` anywhere in `html`.
pub fn first_image_in(html: &str) -> Option<ImageSpec> {
    let fragment = Html::parse_fragment(html);
    first_image(fragment.root_element())
}

fn element_to_blocks(
    element: ElementRef<'_>,
    resolve_image: &mut dyn FnMut(ImageSpec) -> ImageSpec,
) -> Vec<Block> {
    let tag = element.value().name();
    match tag {
        "p" => {
            let inner = element.inner_html();
            let inner = inner.trim();
            if is_blank(inner) {
                return Vec::new();
            }
            let text = element.text().collect::<String>();
            if text.trim().is_empty()
                && let Some(image) = first_image(element)
            {
                return vec![block::image(&resolve_image(image))];
            }
            vec![block::paragraph(inner)]
        }
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag[1..].parse::<u8>().unwrap_or(2);
            vec![block::heading(level, element.inner_html().trim())]
        }
        "ul" | "ol" => {
            let items = child_elements(element)
                .filter(|child| child.value().name() == "li")
                .map(|child| child.inner_html().trim().to_string())
                .collect::<Vec<_>>();
            vec![block::list(tag == "ol", &items)]
        }
        "blockquote" => {
            if element.value().attr("class").is_some() {
                return vec![block::html(&element.html())];
            }
            let citation = child_elements(element)
                .find(|child| child.value().name() == "cite")
                .map(|child| child.inner_html().trim().to_string());
            let mut paragraphs = child_elements(element)
                .filter(|child| child.value().name() == "p")
                .map(|child| child.inner_html().trim().to_string())
                .filter(|inner| !is_blank(inner))
                .collect::<Vec<_>>();
            if paragraphs.is_empty() {
                let text = element
                    .children()
                    .filter(|node| {
                        ElementRef::wrap(*node)
                            .map(|child| child.value().name() != "cite")
                            .unwrap_or(true)
                    })
                    .map(|node| match ElementRef::wrap(node) {
                        Some(child) => child.html(),
                        None => node
                            .value()
                            .as_text()
                            .map(|text| escape_html(text))
                            .unwrap_or_default(),
                    })
                    .collect::<String>();
                if !is_blank(text.trim()) {
                    paragraphs.push(text.trim().to_string());
                }
            }
            vec![block::quote(&paragraphs, citation.as_deref())]
        }
        "figure" => match first_image(element) {
            Some(mut image) => {
                image.caption = element
                    .descendants()
                    .filter_map(ElementRef::wrap)
                    .find(|child| child.value().name() == "figcaption")
                    .map(|child| child.inner_html().trim().to_string());
                vec![block::image(&resolve_image(image))]
            }
            None => vec![block::html(&element.html())],
        },
        "img" => match image_from(element) {
            Some(image) => vec![block::image(&resolve_image(image))],
            None => Vec::new(),
        },
        "hr" => vec![block::separator()],
        "iframe" => match element.value().attr("src") {
            Some(src) if block::embed_provider(src).is_some() => vec![block::embed(src, None)],
            _ => vec![block::html(&element.html())],
        },
        "div" if element.value().attrs().next().is_none() => {
            html_to_blocks_with(&element.inner_html(), resolve_image)
        }
        _ => vec![block::html(&element.html())],
    }
}

fn flush_inline(inline: &mut String, blocks: &mut Vec<Block>) {
    if inline.trim().is_empty() {
        inline.clear();
        return;
    }
    let normalized = inline.replace("\r\n", "\n");
    for chunk in normalized.split("\n\n") {
        let chunk = chunk.trim();
        if !is_blank(chunk) {
            blocks.push(block::paragraph(&chunk.replace('\n', "<br>")));
        }
    }
    inline.clear();
}

fn child_elements<'a>(element: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    element.children().filter_map(ElementRef::wrap)
}

fn first_image(element: ElementRef<'_>) -> Option<ImageSpec> {
    element
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|child| child.value().name() == "img")
        .and_then(image_from)
}

fn image_from(element: ElementRef<'_>) -> Option<ImageSpec> {
    let src = element.value().attr("src")?.trim();
    if src.is_empty() {
        return None;
    }
    let id = element.value().attr("class").and_then(|class| {
        class
            .split_whitespace()
            .find_map(|name| name.strip_prefix("wp-image-"))
            .and_then(|id| id.parse::<i64>().ok())
    });
    Some(ImageSpec {
        id,
        url: src.to_string(),
        alt: element.value().attr("alt").unwrap_or_default().to_string(),
        caption: None,
    })
}

fn is_blank(html: &str) -> bool {
    html.replace("&nbsp;", "")
        .replace('\u{a0}', "")
        .replace("<br>", "")
        .trim()
        .is_empty()
}
