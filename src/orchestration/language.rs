//! Output-language handling for the optimize handler.
//!
//! Only English and Arabic are told apart. The heuristic is the share of
//! alphabetic characters that fall in the Arabic blocks.

/// Arabic share separating Arabic from non-Arabic text
pub const DEFAULT_TRANSLATION_THRESHOLD: f64 = 0.15;

const ARABIC_RANGES: [(char, char); 5] = [
    ('\u{0600}', '\u{06FF}'),
    ('\u{0750}', '\u{077F}'),
    ('\u{08A0}', '\u{08FF}'),
    ('\u{FB50}', '\u{FDFF}'),
    ('\u{FE70}', '\u{FEFF}'),
];

fn is_arabic(ch: char) -> bool {
    ARABIC_RANGES
        .iter()
        .any(|&(low, high)| (low..=high).contains(&ch))
}

/// Display name for a language code; unknown codes read as English
pub fn language_name(code: Option<&str>) -> &'static str {
    match code {
        Some("ar") => "Arabic",
        _ => "English",
    }
}

/// Fraction of alphabetic characters that are Arabic; 0.0 without letters
pub fn arabic_ratio(text: &str) -> f64 {
    let (letters, arabic) = text
        .chars()
        .filter(|ch| ch.is_alphabetic())
        .fold((0usize, 0usize), |(letters, arabic), ch| {
            (letters + 1, arabic + usize::from(is_arabic(ch)))
        });
    if letters == 0 {
        return 0.0;
    }
    arabic as f64 / letters as f64
}

/// Whether `text` is not yet in `target_lang`
pub fn needs_translation(text: &str, target_lang: &str, threshold: f64) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    match target_lang {
        "ar" => arabic_ratio(text) < threshold,
        "en" => arabic_ratio(text) > threshold,
        _ => false,
    }
}

/// Language block appended to the optimize system prompt
pub fn language_instructions(
    resume_lang: Option<&str>,
    jd_lang: Option<&str>,
    target_lang: &str,
) -> String {
    let target = language_name(Some(target_lang));
    format!(
        "Language context:\n\
         - Resume language: {resume}\n\
         - Job description language: {jd}\n\
         - Desired output language: {target}\n\
         \n\
         Rules:\n\
         - preview_markdown MUST be written in {target}.\n\
         - If the resume or job description is in a different language, translate the content into {target}.\n\
         - Keep proper nouns (company names, product names, certifications) in their original language.\n\
         - If preserving ATS keywords helps, you may keep the original keyword in parentheses.",
        resume = language_name(resume_lang),
        jd = language_name(jd_lang),
    )
}

/// System prompt for the best-effort preview translation
pub fn translation_prompt(target_lang: &str) -> String {
    let target = language_name(Some(target_lang));
    format!(
        "You are a professional translator.\n\
         Translate the resume into {target}.\n\
         \n\
         Rules:\n\
         - Preserve Markdown formatting and headings.\n\
         - Keep names, emails, URLs, and proper nouns as-is.\n\
         - Output ONLY the translated Markdown."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arabic_ratio() {
        assert_eq!(arabic_ratio(""), 0.0);
        assert_eq!(arabic_ratio("1234 !!"), 0.0);
        assert_eq!(arabic_ratio("Rust developer"), 0.0);
        assert!((arabic_ratio("مهندس") - 1.0).abs() < f64::EPSILON);
        let mixed = arabic_ratio("ab مه");
        assert!((mixed - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_needs_translation() {
        let english = "# Summary\nSenior engineer with Rust experience";
        let arabic = "# ملخص\nمهندس برمجيات أول";
        assert!(needs_translation(english, "ar", DEFAULT_TRANSLATION_THRESHOLD));
        assert!(!needs_translation(english, "en", DEFAULT_TRANSLATION_THRESHOLD));
        assert!(needs_translation(arabic, "en", DEFAULT_TRANSLATION_THRESHOLD));
        assert!(!needs_translation(arabic, "ar", DEFAULT_TRANSLATION_THRESHOLD));
        assert!(!needs_translation("   ", "ar", DEFAULT_TRANSLATION_THRESHOLD));
        assert!(!needs_translation(english, "fr", DEFAULT_TRANSLATION_THRESHOLD));
    }

    #[test]
    fn test_language_instructions_name_target() {
        let block = language_instructions(Some("en"), Some("ar"), "ar");
        assert!(block.contains("- Resume language: English"));
        assert!(block.contains("- Job description language: Arabic"));
        assert!(block.contains("preview_markdown MUST be written in Arabic."));
    }
}
