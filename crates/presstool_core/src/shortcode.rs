use std::ops::Range;

/// One parsed shortcode occurrence with its byte span in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortcode {
    pub name: String,
    pub attrs: ShortcodeAttrs,
    /// Enclosed text for `[name]…[/name]`; `None` for self-contained tags.
    pub content: Option<String>,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortcodeAttrs {
    named: Vec<(String, String)>,
    positional: Vec<String>,
}

impl ShortcodeAttrs {
    /// Named attribute lookup; names are stored lowercased.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.named
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    pub fn named(&self) -> &[(String, String)] {
        &self.named
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }
}

/// Finds shortcodes whose name satisfies `wanted`, left to right, without nesting.
///
/// Escaped tags (`[[name]]`) are skipped and left literal. A tag is enclosing
/// when a matching `[/name]` follows it; otherwise it stands alone.
pub fn parse_shortcodes(text: &str, wanted: impl Fn(&str) -> bool) -> Vec<Shortcode> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find('[') {
        let start = cursor + offset;
        if text[start..].starts_with("[[") {
            if let Some(inner) = parse_at(text, start + 1)
                && text[inner.span.end..].starts_with(']')
            {
                cursor = inner.span.end + 1;
            } else {
                cursor = start + 1;
            }
            continue;
        }
        match parse_at(text, start) {
            Some(shortcode) if wanted(&shortcode.name) => {
                cursor = shortcode.span.end;
                found.push(shortcode);
            }
            _ => cursor = start + 1,
        }
    }
    found
}

/// Distinct opening tag names in order of first appearance.
pub fn shortcode_names(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find('[') {
        let start = cursor + offset;
        if text[start..].starts_with("[[") {
            cursor = start + 2;
            continue;
        }
        cursor = start + 1;
        if let Some(tag) = parse_open_tag(text, start)
            && !names.iter().any(|name| *name == tag.name)
        {
            names.push(tag.name);
        }
    }
    names
}

struct OpenTag {
    name: String,
    raw_attrs: String,
    self_closing: bool,
    end: usize,
}

fn parse_at(text: &str, start: usize) -> Option<Shortcode> {
    let tag = parse_open_tag(text, start)?;
    let attrs = parse_attrs(&tag.raw_attrs);
    if tag.self_closing {
        return Some(Shortcode {
            name: tag.name,
            attrs,
            content: None,
            span: start..tag.end,
        });
    }

    // Names are lowercased ASCII, and ASCII lowercasing keeps byte offsets.
    let closing = format!("[/{}]", tag.name);
    match text[tag.end..].to_ascii_lowercase().find(&closing) {
        Some(offset) => {
            let content_end = tag.end + offset;
            Some(Shortcode {
                content: Some(text[tag.end..content_end].to_string()),
                span: start..content_end + closing.len(),
                name: tag.name,
                attrs,
            })
        }
        None => Some(Shortcode {
            name: tag.name,
            attrs,
            content: None,
            span: start..tag.end,
        }),
    }
}

fn parse_open_tag(text: &str, start: usize) -> Option<OpenTag> {
    let rest = text.get(start..)?;
    let after_bracket = rest.strip_prefix('[')?;
    let name_len = after_bracket
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'))
        .map(|(index, _)| index)
        .unwrap_or(after_bracket.len());
    if name_len == 0 {
        return None;
    }
    let name = &after_bracket[..name_len];
    let tail = &after_bracket[name_len..];
    match tail.chars().next() {
        Some(ch) if ch.is_whitespace() || ch == ']' || ch == '/' => {}
        _ => return None,
    }

    let mut quote: Option<char> = None;
    let mut close = None;
    for (index, ch) in tail.char_indices() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                ']' => {
                    close = Some(index);
                    break;
                }
                '[' => return None,
                _ => {}
            },
        }
    }
    let close = close?;
    let raw = tail[..close].trim();
    let (raw_attrs, self_closing) = match raw.strip_suffix('/') {
        Some(stripped) => (stripped.trim_end(), true),
        None => (raw, false),
    };
    Some(OpenTag {
        name: name.to_ascii_lowercase(),
        raw_attrs: raw_attrs.to_string(),
        self_closing,
        end: start + 1 + name_len + close + 1,
    })
}

fn parse_attrs(raw: &str) -> ShortcodeAttrs {
    let mut attrs = ShortcodeAttrs::default();
    let chars = raw.chars().collect::<Vec<_>>();
    let mut index = 0;
    while index < chars.len() {
        if chars[index].is_whitespace() {
            index += 1;
            continue;
        }
        if chars[index] == '"' || chars[index] == '\'' {
            let (value, next) = read_quoted(&chars, index);
            attrs.positional.push(value);
            index = next;
            continue;
        }

        let key_start = index;
        while index < chars.len() && !chars[index].is_whitespace() && chars[index] != '=' {
            index += 1;
        }
        let key = chars[key_start..index].iter().collect::<String>();
        if index < chars.len() && chars[index] == '=' {
            index += 1;
            let value = if index < chars.len() && (chars[index] == '"' || chars[index] == '\'') {
                let (value, next) = read_quoted(&chars, index);
                index = next;
                value
            } else {
                let value_start = index;
                while index < chars.len() && !chars[index].is_whitespace() {
                    index += 1;
                }
                chars[value_start..index].iter().collect()
            };
            attrs.named.push((key.to_ascii_lowercase(), value));
        } else {
            attrs.positional.push(key);
        }
    }
    attrs
}

fn read_quoted(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut index = start + 1;
    let mut value = String::new();
    while index < chars.len() && chars[index] != quote {
        value.push(chars[index]);
        index += 1;
    }
    (value, (index + 1).min(chars.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(text: &str) -> Vec<Shortcode> {
        parse_shortcodes(text, |_| true)
    }

    #[test]
    fn parses_unquoted_list_attribute() {
        let text = "Before [gallery ids=1,2,3] after";
        let found = all(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "gallery");
        assert_eq!(found[0].attrs.get("ids"), Some("1,2,3"));
        assert_eq!(&text[found[0].span.clone()], "[gallery ids=1,2,3]");
    }

    #[test]
    fn parses_quoted_and_positional_attributes() {
        let found = all(r#"[embed width="640" height='360' autoplay "https://x.example/v"]"#);
        let attrs = &found[0].attrs;
        assert_eq!(attrs.get("WIDTH"), Some("640"));
        assert_eq!(attrs.get("height"), Some("360"));
        assert_eq!(attrs.positional(0), Some("autoplay"));
        assert_eq!(attrs.positional(1), Some("https://x.example/v"));
    }

    #[test]
    fn enclosing_shortcode_captures_content() {
        let text = r#"x [caption id="attachment_9" align="alignleft"]<img src="a.jpg" /> A caption[/caption] y"#;
        let found = all(text);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].content.as_deref(),
            Some(r#"<img src="a.jpg" /> A caption"#)
        );
        assert!(text[found[0].span.clone()].ends_with("[/caption]"));
    }

    #[test]
    fn closing_tag_matches_regardless_of_case() {
        let text = "a [Caption]<img src=\"b.jpg\" /> Mixed[/Caption] c [CAPTION]x[/caption] d";
        let found = all(text);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "caption");
        assert_eq!(found[0].content.as_deref(), Some("<img src=\"b.jpg\" /> Mixed"));
        assert_eq!(&text[found[0].span.clone()], "[Caption]<img src=\"b.jpg\" /> Mixed[/Caption]");
        assert_eq!(found[1].content.as_deref(), Some("x"));
    }

    #[test]
    fn self_closing_tag_ignores_later_closer() {
        let found = all("[audio src=\"a.mp3\" /] text [/audio]");
        assert_eq!(found[0].content, None);
        assert_eq!(found[0].attrs.get("src"), Some("a.mp3"));
    }

    #[test]
    fn escaped_shortcodes_are_left_alone() {
        assert!(all("literal [[gallery ids=1]] text").is_empty());
        let found = all("[[gallery]] then [gallery ids=4]");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attrs.get("ids"), Some("4"));
    }

    #[test]
    fn filter_skips_other_names_and_prefix_matches() {
        let found = parse_shortcodes("[gallery-pro ids=1][gallery ids=2][video]", |name| {
            name == "gallery"
        });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attrs.get("ids"), Some("2"));
    }

    #[test]
    fn brackets_that_are_not_tags_are_ignored() {
        assert_eq!(all("a [ b ] c [/x] d").len(), 0);
        assert!(all("unterminated [gallery ids=1").is_empty());
    }

    #[test]
    fn names_are_listed_once() {
        assert_eq!(
            shortcode_names("[b]x[/b] [gallery] [b] [[esc]]"),
            vec!["b".to_string(), "gallery".to_string()]
        );
    }
}
