/// Lowercase slug: accented Latin folded to ASCII, other alphanumerics (Cyrillic, CJK, ...)
/// kept as lowercase Unicode, every other run collapsed into one `-`.
pub fn slugify(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_dash = false;
    for ch in value.chars() {
        let folded = fold_latin(ch);
        if folded.is_ascii_alphanumeric() {
            output.push(folded.to_ascii_lowercase());
            previous_dash = false;
        } else if folded.is_alphanumeric() {
            output.extend(folded.to_lowercase());
            previous_dash = false;
        } else if !previous_dash && !output.is_empty() {
            output.push('-');
            previous_dash = true;
        }
    }
    while output.ends_with('-') {
        output.pop();
    }
    output
}

pub fn normalize_spaces(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn escape_html(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            _ => output.push(ch),
        }
    }
    output
}

pub fn decode_entities(value: &str) -> String {
    value
        .replace("&nbsp;", " ")
        .replace("&#8217;", "\u{2019}")
        .replace("&#8216;", "\u{2018}")
        .replace("&#8220;", "\u{201c}")
        .replace("&#8221;", "\u{201d}")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn fold_latin(ch: char) -> char {
    match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'Ç' => 'C',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'Ñ' => 'N',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_entities, escape_html, normalize_spaces, slugify};

    #[test]
    fn slugify_collapses_punctuation_and_accents() {
        assert_eq!(slugify("City Hall Vote!"), "city-hall-vote");
        assert_eq!(slugify("  José  Núñez "), "jose-nunez");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn slugify_keeps_non_latin_letters() {
        assert_eq!(slugify("Новости"), "новости");
        assert_eq!(slugify("Иван Петров"), "иван-петров");
        assert_eq!(slugify("李伟"), "李伟");
        assert_eq!(slugify("Αθήνα 2024"), "αθήνα-2024");
    }

    #[test]
    fn normalize_spaces_collapses_runs() {
        assert_eq!(normalize_spaces(" Jane \t Doe\n"), "Jane Doe");
    }

    #[test]
    fn escape_and_decode_are_consistent_for_markup_chars() {
        let raw = "Q&A <b>\"quoted\"</b>";
        assert_eq!(decode_entities(&escape_html(raw)), raw);
    }
}
