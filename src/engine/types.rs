use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptDirection {
    Ltr,
    Rtl,
}

impl ScriptDirection {
    /// A model is treated as right-to-left when its name contains one of the
    /// configured markers (`ara`, `heb`, ...). Combined models like
    /// `frk+ara` count as right-to-left.
    pub fn detect(model: &str, rtl_markers: &[String]) -> Self {
        let model = model.to_ascii_lowercase();
        let rtl = model
            .split(['+', '_', '-', '/'])
            .any(|part| rtl_markers.iter().any(|m| part.starts_with(&m.to_ascii_lowercase())));
        if rtl { Self::Rtl } else { Self::Ltr }
    }

    pub fn text_equiv_level(self) -> TextEquivLevel {
        match self {
            Self::Ltr => TextEquivLevel::Word,
            Self::Rtl => TextEquivLevel::Glyph,
        }
    }
}

/// Granularity at which the recognizer emits text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEquivLevel {
    Word,
    Glyph,
}

impl TextEquivLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Word => "word",
            Self::Glyph => "glyph",
        }
    }
}
