//! Classification of announced media into decode chain families.

use std::fmt;

use crate::engine::Capabilities;

const RTP_MEDIA_TYPE: &str = "application/x-rtp";

/// Codec families a decode chain can be assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecTag {
    H264,
    H265,
}

impl CodecTag {
    pub const ALL: [CodecTag; 2] = [CodecTag::H264, CodecTag::H265];

    /// The `encoding-name` token announcing this codec.
    pub fn encoding_name(&self) -> &'static str {
        match self {
            CodecTag::H264 => "H264",
            CodecTag::H265 => "H265",
        }
    }

    pub fn depayloader(&self) -> &'static str {
        match self {
            CodecTag::H264 => "rtph264depay",
            CodecTag::H265 => "rtph265depay",
        }
    }

    pub fn parser(&self) -> &'static str {
        match self {
            CodecTag::H264 => "h264parse",
            CodecTag::H265 => "h265parse",
        }
    }

    fn from_encoding_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.encoding_name() == name)
    }
}

impl fmt::Display for CodecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecTag::H264 => f.write_str("H.264"),
            CodecTag::H265 => f.write_str("H.265"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NotRtp(String),
    NotVideo(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::NotRtp(media_type) => write!(f, "not an RTP payload ({})", media_type),
            IgnoreReason::NotVideo(media) => write!(f, "{} track", media),
        }
    }
}

/// Outcome of inspecting one announcement. Only `Supported` leads to a chain;
/// the other two leave the connection point alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Supported(CodecTag),
    Ignored(IgnoreReason),
    Unsupported(String),
}

/// Pick the chain family for an announced connection point.
///
/// Only RTP video payloads are considered. The `encoding-name` attribute is
/// compared case-sensitively.
pub fn classify(caps: &Capabilities) -> Classification {
    if !caps.media_type.starts_with(RTP_MEDIA_TYPE) {
        return Classification::Ignored(IgnoreReason::NotRtp(caps.media_type.clone()));
    }

    match caps.get("media") {
        Some("video") => {}
        Some(other) => return Classification::Ignored(IgnoreReason::NotVideo(other.to_string())),
        None => return Classification::Ignored(IgnoreReason::NotVideo("unknown".to_string())),
    }

    match caps.get("encoding-name") {
        Some(name) => match CodecTag::from_encoding_name(name) {
            Some(tag) => Classification::Supported(tag),
            None => Classification::Unsupported(name.to_string()),
        },
        None => Classification::Unsupported(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_video_codecs() {
        assert_eq!(
            classify(&Capabilities::rtp("video", "H264")),
            Classification::Supported(CodecTag::H264)
        );
        assert_eq!(
            classify(&Capabilities::rtp("video", "H265")),
            Classification::Supported(CodecTag::H265)
        );
    }

    #[test]
    fn test_classify_audio_is_ignored() {
        for encoding in ["H264", "MPEG4-GENERIC", "PCMU"] {
            assert!(matches!(
                classify(&Capabilities::rtp("audio", encoding)),
                Classification::Ignored(IgnoreReason::NotVideo(_))
            ));
        }
    }

    #[test]
    fn test_classify_unknown_encoding() {
        assert_eq!(
            classify(&Capabilities::rtp("video", "VP8")),
            Classification::Unsupported("VP8".to_string())
        );
        // Matching is case-sensitive.
        assert_eq!(
            classify(&Capabilities::rtp("video", "h264")),
            Classification::Unsupported("h264".to_string())
        );
    }

    #[test]
    fn test_classify_non_rtp() {
        let caps = Capabilities::new("video/x-raw").with_field("media", "video");
        assert!(matches!(
            classify(&caps),
            Classification::Ignored(IgnoreReason::NotRtp(_))
        ));
    }

    #[test]
    fn test_chain_element_names() {
        assert_eq!(CodecTag::H264.depayloader(), "rtph264depay");
        assert_eq!(CodecTag::H265.parser(), "h265parse");
        assert_eq!(CodecTag::H265.to_string(), "H.265");
    }
}
