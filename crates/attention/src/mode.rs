//! Execution modes shared by attention and the decoder.

use std::fmt;
use std::str::FromStr;

/// How a forward pass interacts with the key/value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelMode {
    /// Full-sequence pass, no cache.
    #[default]
    Train,
    /// Full-prompt pass that (re)fills the cache.
    Prefill,
    /// Incremental pass that appends to the cache and attends over it.
    Autoregressive,
}

impl ModelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Prefill => "prefill",
            Self::Autoregressive => "autoregressive",
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "prefill" => Ok(Self::Prefill),
            "autoregressive" | "decode" => Ok(Self::Autoregressive),
            other => Err(format!("unknown model mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("train".parse::<ModelMode>(), Ok(ModelMode::Train));
        assert_eq!(" Prefill ".parse::<ModelMode>(), Ok(ModelMode::Prefill));
        assert_eq!("decode".parse::<ModelMode>(), Ok(ModelMode::Autoregressive));
        assert!("eval".parse::<ModelMode>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for mode in [ModelMode::Train, ModelMode::Prefill, ModelMode::Autoregressive] {
            assert_eq!(mode.to_string().parse::<ModelMode>(), Ok(mode));
        }
    }
}
