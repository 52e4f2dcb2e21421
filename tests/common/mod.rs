/// Shared fixtures for integration tests
use cinemashield::error::ToolError;
use cinemashield::modules::crypto::AesGcmCipher;
use cinemashield::modules::media_api::AppState;
use cinemashield::modules::tools::{ByteConcatRemuxer, Segmenter};
use cinemashield::settings::{RemuxerKind, ServerSettings};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Cuts the source into `parts` byte ranges, standing in for ffmpeg.
pub struct SplitSegmenter {
    pub parts: usize,
}

impl Segmenter for SplitSegmenter {
    fn segment(&self, source: &Path, out_dir: &Path) -> Result<usize, ToolError> {
        let data = fs::read(source)?;
        let chunk = data.len().div_ceil(self.parts).max(1);
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut count = 0;
        for (i, part) in data.chunks(chunk).enumerate() {
            fs::write(out_dir.join(format!("{}_part{:03}.mp4", stem, i)), part)?;
            count += 1;
        }
        Ok(count)
    }
}

pub fn settings(data_dir: &Path, playback_hours: u32) -> ServerSettings {
    ServerSettings {
        data_dir: data_dir.to_path_buf(),
        playback_hours,
        total_shards: 3,
        remuxer: RemuxerKind::Concat,
        ..ServerSettings::default()
    }
}

pub fn app_state(data_dir: &Path, playback_hours: u32) -> Arc<AppState> {
    Arc::new(
        AppState::new(
            settings(data_dir, playback_hours),
            Arc::new(SplitSegmenter { parts: 3 }),
            Arc::new(ByteConcatRemuxer),
            Arc::new(AesGcmCipher),
        )
        .expect("app state"),
    )
}

/// Deterministic stand-in for a media file.
pub fn sample_media(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
