//! Named export presets.

use serde::Serialize;

/// Encoder settings for a named output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolutionPreset {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub video_codec: &'static str,
    pub audio_codec: &'static str,
    pub crf: u8,
}

const fn h264(
    name: &'static str,
    width: u32,
    height: u32,
    video_bitrate_kbps: u32,
    audio_bitrate_kbps: u32,
    crf: u8,
) -> ResolutionPreset {
    ResolutionPreset {
        name,
        width,
        height,
        video_bitrate_kbps,
        audio_bitrate_kbps,
        video_codec: "libx264",
        audio_codec: "aac",
        crf,
    }
}

/// Built-in presets, in display order.
pub const RESOLUTION_PRESETS: &[ResolutionPreset] = &[
    h264("4K", 3840, 2160, 15_000, 320, 18),
    h264("1080p", 1920, 1080, 8_000, 192, 20),
    h264("720p", 1280, 720, 4_000, 128, 22),
    h264("480p", 854, 480, 2_000, 128, 24),
    h264("Instagram_Story", 1080, 1920, 6_000, 128, 20),
    h264("TikTok", 1080, 1920, 4_000, 128, 22),
    h264("YouTube_Shorts", 1080, 1920, 5_000, 192, 20),
];

/// Preset used for low-fidelity previews.
pub const PREVIEW_PRESET: &str = "480p";

/// Look up a preset by name, ignoring ASCII case.
pub fn find_preset(name: &str) -> Option<&'static ResolutionPreset> {
    RESOLUTION_PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

pub fn preset_names() -> impl Iterator<Item = &'static str> {
    RESOLUTION_PRESETS.iter().map(|p| p.name)
}

impl ResolutionPreset {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn is_vertical(&self) -> bool {
        self.height > self.width
    }

    /// Approximate container size for `duration_secs` of output.
    pub fn estimated_size_bytes(&self, duration_secs: f64, include_audio: bool) -> u64 {
        let mut kbps = self.video_bitrate_kbps as f64;
        if include_audio {
            kbps += self.audio_bitrate_kbps as f64;
        }
        (kbps * 1000.0 / 8.0 * duration_secs.max(0.0)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_preset() {
        let preset = find_preset("1080p").unwrap();
        assert_eq!(preset.resolution(), "1920x1080");
        assert_eq!(preset.crf, 20);
        assert_eq!(find_preset("tiktok").unwrap().name, "TikTok");
        assert!(find_preset("8K").is_none());
        assert!(find_preset(PREVIEW_PRESET).is_some());
    }

    #[test]
    fn test_vertical_presets() {
        let vertical: Vec<_> = RESOLUTION_PRESETS
            .iter()
            .filter(|p| p.is_vertical())
            .map(|p| p.name)
            .collect();
        assert_eq!(vertical, ["Instagram_Story", "TikTok", "YouTube_Shorts"]);
    }

    #[test]
    fn test_estimated_size() {
        let preset = find_preset("720p").unwrap();
        // 4128 kbps for 10s
        assert_eq!(preset.estimated_size_bytes(10.0, true), 5_160_000);
        assert_eq!(preset.estimated_size_bytes(10.0, false), 5_000_000);
        assert_eq!(preset.estimated_size_bytes(-1.0, true), 0);
    }
}
