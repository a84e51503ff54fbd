//! Language resolution for the engine configuration.
//!
//! The app passes an opaque language code; the engine is configured with the
//! human-readable name embedded in a fixed system instruction. Language is
//! fixed per connection — switching requires a full session replacement.

/// Fallback when a code is unknown.
pub const DEFAULT_LANGUAGE: &str = "English";

/// Resolve a language code to the display name used in the engine setup.
///
/// Unknown or empty codes fall back to [`DEFAULT_LANGUAGE`].
pub fn display_name(code: &str) -> &'static str {
    match code {
        "en" => "English",
        "hi" => "Hindi",
        "mr" => "Marathi",
        "bn" => "Bengali",
        "ta" => "Tamil",
        "te" => "Telugu",
        "kn" => "Kannada",
        "ml" => "Malayalam",
        "gu" => "Gujarati",
        "pa" => "Punjabi",
        "or" => "Odia",
        "as" => "Assamese",
        "ur" => "Urdu",
        "ne" => "Nepali",
        _ => DEFAULT_LANGUAGE,
    }
}

/// The persona brief sent as the engine's system instruction, parameterized
/// only by the resolved language name.
pub fn system_instruction(language_name: &str) -> String {
    format!(
        "You are Krishi Sathi, a friendly voice advisor for smallholder farmers. \
         Answer questions about crops, soil, weather, pests, and market prices \
         with short, practical guidance a farmer can act on today. \
         Always speak in {language_name}, regardless of the language the user speaks. \
         Keep every answer under three sentences unless asked for detail."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_codes() {
        assert_eq!(display_name("mr"), "Marathi");
        assert_eq!(display_name("hi"), "Hindi");
        assert_eq!(display_name("en"), "English");
    }

    #[test]
    fn unknown_code_falls_back() {
        assert_eq!(display_name("zz"), DEFAULT_LANGUAGE);
        assert_eq!(display_name(""), DEFAULT_LANGUAGE);
    }

    #[test]
    fn instruction_embeds_language_name() {
        let brief = system_instruction("Marathi");
        assert!(brief.contains("Marathi"));
        assert!(brief.contains("farmers"));
    }
}
