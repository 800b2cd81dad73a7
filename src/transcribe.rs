use serde_json::Value;
use tracing::warn;

use crate::driver::Stage;
use crate::sample::Sample;
use crate::{Error, Result};

/// Metadata field holding the transcript.
pub const TRANSCRIPT_FIELD: &str = "whisper_transcript";
/// Metadata field holding word-level alignment, when the transcriber produces one.
pub const ALIGNMENT_FIELD: &str = "whisper_alignment";
/// Metadata field recording why an item could not be transcribed.
pub const ERROR_FIELD: &str = "transcription_error";
/// Metadata field recording an alignment failure next to a kept transcript.
pub const ALIGNMENT_ERROR_FIELD: &str = "alignment_error";

/// Pluggable speech-to-text model.
///
/// Implementations take the raw bytes of an audio blob; decoding and resampling are theirs.
/// The packager only cares about the JSON that comes back.
pub trait Transcriber {
    /// Transcribe one item.
    fn transcribe(&self, audio: &[u8]) -> Result<Value>;

    /// Produce an alignment for a transcript. `Ok(None)` means alignment is not supported.
    fn align(&self, _transcript: &Value, _audio: &[u8]) -> Result<Option<Value>> {
        Ok(None)
    }
}

impl<T: Transcriber + ?Sized> Transcriber for &T {
    fn transcribe(&self, audio: &[u8]) -> Result<Value> {
        (**self).transcribe(audio)
    }

    fn align(&self, transcript: &Value, audio: &[u8]) -> Result<Option<Value>> {
        (**self).align(transcript, audio)
    }
}

/// What happened to one item of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Transcribed { aligned: bool },
    Failed(String),
    /// The sample has no blob under the audio name.
    NoAudio,
}

/// Transcribe one sample in place, tagging its metadata with the result.
///
/// Never fails: problems are recorded in the metadata and the returned outcome.
pub fn transcribe_one<T: Transcriber + ?Sized>(
    transcriber: &T,
    sample: &mut Sample,
    audio_blob: &str,
) -> ItemOutcome {
    if !sample.metadata.is_object() {
        let message = "metadata is not a JSON object".to_owned();
        warn!(index = sample.index, %message, "cannot tag transcription result");
        return ItemOutcome::Failed(message);
    }

    let audio = match sample.blob(audio_blob) {
        Some(blob) => blob.data.to_bytes(),
        None => return ItemOutcome::NoAudio,
    };
    let audio = match audio {
        Ok(audio) => audio,
        Err(err) => return fail(sample, format!("reading {audio_blob}: {err}")),
    };

    let transcript = match transcriber.transcribe(&audio) {
        Ok(transcript) => transcript,
        Err(err) => return fail(sample, err.to_string()),
    };

    let alignment = transcriber.align(&transcript, &audio);
    set_field(sample, TRANSCRIPT_FIELD, transcript);
    match alignment {
        Ok(Some(alignment)) => {
            set_field(sample, ALIGNMENT_FIELD, alignment);
            ItemOutcome::Transcribed { aligned: true }
        }
        Ok(None) => ItemOutcome::Transcribed { aligned: false },
        Err(err) => {
            warn!(index = sample.index, error = %err, "alignment failed, keeping transcript");
            set_field(sample, ALIGNMENT_ERROR_FIELD, Value::String(err.to_string()));
            ItemOutcome::Transcribed { aligned: false }
        }
    }
}

fn fail(sample: &mut Sample, message: String) -> ItemOutcome {
    warn!(index = sample.index, %message, "transcription failed");
    set_field(sample, ERROR_FIELD, Value::String(message.clone()));
    ItemOutcome::Failed(message)
}

fn set_field(sample: &mut Sample, key: &str, value: Value) {
    if let Some(map) = sample.metadata.as_object_mut() {
        map.insert(key.to_owned(), value);
    }
}

/// Transcribe a batch. A failed item is tagged and kept; the rest of the batch is unaffected.
pub fn transcribe_batch<T: Transcriber + ?Sized>(
    transcriber: &T,
    samples: Vec<Sample>,
    audio_blob: &str,
) -> Vec<(Sample, ItemOutcome)> {
    samples
        .into_iter()
        .map(|mut sample| {
            let outcome = transcribe_one(transcriber, &mut sample, audio_blob);
            (sample, outcome)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranscribeStats {
    pub transcribed: u64,
    pub failed: u64,
    pub no_audio: u64,
}

/// Runs a [`Transcriber`] on every sample passing through the driver.
pub struct TranscribeStage<T> {
    transcriber: T,
    audio_blob: String,
    require_success: bool,
    stats: TranscribeStats,
}

impl<T: Transcriber> TranscribeStage<T> {
    pub fn new(transcriber: T, audio_blob: impl Into<String>) -> Self {
        Self {
            transcriber,
            audio_blob: audio_blob.into(),
            require_success: false,
            stats: TranscribeStats::default(),
        }
    }

    /// Fail the run on the first item that cannot be transcribed instead of tagging it.
    pub fn require_success(mut self, yes: bool) -> Self {
        self.require_success = yes;
        self
    }

    pub fn stats(&self) -> TranscribeStats {
        self.stats
    }
}

impl<T: Transcriber> Stage for TranscribeStage<T> {
    fn process(&mut self, mut sample: Sample) -> Result<Sample> {
        match transcribe_one(&self.transcriber, &mut sample, &self.audio_blob) {
            ItemOutcome::Transcribed { .. } => self.stats.transcribed += 1,
            ItemOutcome::NoAudio => self.stats.no_audio += 1,
            ItemOutcome::Failed(message) => {
                self.stats.failed += 1;
                if self.require_success {
                    let index = sample.index;
                    sample.discard();
                    return Err(Error::Model(format!("sample {index}: {message}")));
                }
            }
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::BlobData;
    use serde_json::json;

    /// Fails on empty audio, echoes the length otherwise.
    struct Echo {
        align: bool,
    }

    impl Transcriber for Echo {
        fn transcribe(&self, audio: &[u8]) -> Result<Value> {
            if audio.is_empty() {
                return Err(Error::Model("empty audio".to_owned()));
            }
            Ok(json!({ "text": format!("{} bytes", audio.len()) }))
        }

        fn align(&self, _transcript: &Value, audio: &[u8]) -> Result<Option<Value>> {
            Ok(self.align.then(|| json!([{ "start": 0, "end": audio.len() }])))
        }
    }

    fn sample(index: u64, audio: Option<&[u8]>) -> Sample {
        let sample = Sample::new(index, json!({ "key": index }));
        match audio {
            Some(bytes) => sample.with_blob("audio", "wav", BlobData::Bytes(bytes.to_vec())),
            None => sample,
        }
    }

    #[test]
    fn failed_item_does_not_discard_the_batch() {
        let batch = vec![
            sample(0, Some(b"abc")),
            sample(1, Some(b"")),
            sample(2, None),
            sample(3, Some(b"de")),
        ];
        let results = transcribe_batch(&Echo { align: true }, batch, "audio");
        assert_eq!(results.len(), 4);

        let outcomes: Vec<_> = results.iter().map(|(_, o)| o.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                ItemOutcome::Transcribed { aligned: true },
                ItemOutcome::Failed("model error: empty audio".to_owned()),
                ItemOutcome::NoAudio,
                ItemOutcome::Transcribed { aligned: true },
            ]
        );

        assert_eq!(results[0].0.metadata[TRANSCRIPT_FIELD]["text"], "3 bytes");
        assert!(results[0].0.metadata.get(ALIGNMENT_FIELD).is_some());
        assert!(results[1].0.metadata.get(ERROR_FIELD).is_some());
        assert!(results[2].0.metadata.get(TRANSCRIPT_FIELD).is_none());
    }

    #[test]
    fn stage_counts_and_optionally_fails() -> anyhow::Result<()> {
        let mut stage = TranscribeStage::new(Echo { align: false }, "audio");
        let out = stage.process(sample(0, Some(b"x")))?;
        assert!(out.metadata.get(ALIGNMENT_FIELD).is_none());
        stage.process(sample(1, Some(b"")))?;
        stage.process(sample(2, None))?;
        assert_eq!(
            stage.stats(),
            TranscribeStats {
                transcribed: 1,
                failed: 1,
                no_audio: 1
            }
        );

        let mut strict = TranscribeStage::new(Echo { align: false }, "audio").require_success(true);
        assert!(matches!(
            strict.process(sample(3, Some(b""))),
            Err(Error::Model(_))
        ));
        Ok(())
    }
}
