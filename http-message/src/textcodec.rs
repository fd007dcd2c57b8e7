/// Text codec derived from a `charset` content-type modifier. This crate
/// only identifies the codec; transcoding is the caller's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCodec {
    Utf8,
    Ascii,
    Latin1,
    Cp1252,
    PercentUrl,
    PercentUrlMin,
    PercentForm,
    Unknown,
}

impl TextCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextCodec::Utf8 => "utf-8",
            TextCodec::Ascii => "ascii",
            TextCodec::Latin1 => "latin_1",
            TextCodec::Cp1252 => "cp1252",
            TextCodec::PercentUrl => "percent",
            TextCodec::PercentUrlMin => "percent_min",
            TextCodec::PercentForm => "application/x-www-form-urlencoded",
            TextCodec::Unknown => "unknown",
        }
    }

    /// Permissive lookup by charset label, accepting the common aliases.
    pub fn from_label(label: &str) -> TextCodec {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => TextCodec::Utf8,
            "ascii" | "us-ascii" => TextCodec::Ascii,
            "latin_1" | "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "iso8859_1" => {
                TextCodec::Latin1
            }
            "cp1252" | "windows-1252" => TextCodec::Cp1252,
            "percent" => TextCodec::PercentUrl,
            "percent_min" => TextCodec::PercentUrlMin,
            "application/x-www-form-urlencoded" => TextCodec::PercentForm,
            _ => TextCodec::Unknown,
        }
    }
}
