use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::chain::{Block, Ledger, Record};
use crate::fingerprint::sha256_hex;
use crate::normalize::{self, DecodeError, NormalizedImage};
use crate::similarity;
use crate::store::ImageStore;

/// Outcome of a duplicate check that found a match. Carries the matched
/// block so callers can display provenance (owner, registration date).
#[derive(Debug, Clone)]
pub enum Duplicate {
    /// Byte-identical normalized content (fingerprint match).
    Exact(Block),
    /// Perceptually similar content at or above the configured threshold.
    Near(Block),
}

impl Duplicate {
    pub fn block(&self) -> &Block {
        match self {
            Duplicate::Exact(b) | Duplicate::Near(b) => b,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Duplicate::Exact(_))
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("image duplicates block {}", .0.block().index)]
    Duplicate(Duplicate),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Gates every write to the ledger: normalize, fingerprint, exact-match
/// lookup, near-duplicate scan, then append + persist on acceptance.
pub struct RegistrationGate {
    store: ImageStore,
    threshold: f32,
}

impl RegistrationGate {
    pub fn new(store: ImageStore, threshold: f32) -> Self {
        Self { store, threshold }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Run the duplicate checks without mutating anything. Exact fingerprint
    /// match short-circuits the similarity scan; otherwise stored artifacts
    /// are compared in chain order and the first verdict wins.
    pub fn check_duplicate(
        &self,
        raw: &[u8],
        ledger: &Ledger,
    ) -> Result<Option<Duplicate>, DecodeError> {
        let candidate = normalize::normalize(raw)?;
        let fp = sha256_hex(&candidate.bytes);
        Ok(self.check_normalized(&candidate, &fp, ledger))
    }

    fn check_normalized(
        &self,
        candidate: &NormalizedImage,
        fp: &str,
        ledger: &Ledger,
    ) -> Option<Duplicate> {
        if let Some(block) = ledger.find_by_fingerprint(fp) {
            return Some(Duplicate::Exact(block.clone()));
        }

        for block in ledger.records() {
            let Some(name) = block.data.filename.as_deref() else {
                continue;
            };
            // Missing or unreadable reference artifacts are skipped, not
            // escalated: the scan fails open.
            let Some(bytes) = self.store.retrieve(name) else {
                debug!(block = block.index, name, "reference artifact missing, skipping");
                continue;
            };
            let Ok(reference) = image::load_from_memory(&bytes) else {
                debug!(block = block.index, name, "reference artifact unreadable, skipping");
                continue;
            };
            if similarity::is_near_duplicate(&candidate.image, &reference.to_rgb8(), self.threshold)
            {
                return Some(Duplicate::Near(block.clone()));
            }
        }
        None
    }

    /// Register an image: reject duplicates with the matched block, and on
    /// acceptance persist the artifact, append the record and save the
    /// chain. Callers must serialize concurrent registrations externally;
    /// check-then-append holds no lock of its own.
    pub fn register(
        &self,
        raw: &[u8],
        owner: &str,
        ledger: &mut Ledger,
    ) -> Result<Block, RegisterError> {
        let candidate = normalize::normalize(raw)?;
        let fp = sha256_hex(&candidate.bytes);
        if let Some(dup) = self.check_normalized(&candidate, &fp, ledger) {
            return Err(RegisterError::Duplicate(dup));
        }

        let filename = self
            .store
            .store(&fp, &candidate.bytes)
            .context("store normalized image")?;
        let record = Record {
            image_hash: fp,
            owner: owner.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            filename: Some(filename),
        };
        let block = ledger.append(record).clone();
        // Append and save form one unit: if the chain cannot be persisted,
        // the block must not survive in memory either, or the next
        // successful registration would durably register it anyway.
        if let Err(e) = ledger.save() {
            ledger.rollback_last();
            return Err(RegisterError::Other(
                anyhow::Error::new(e).context("persist ledger"),
            ));
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn png_bytes(img: RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn image_a() -> Vec<u8> {
        png_bytes(RgbImage::from_fn(96, 64, |x, _| {
            let v = (x * 255 / 96) as u8;
            Rgb([v, v, v])
        }))
    }

    /// Same scene as A, slightly brightened: different bytes, high
    /// correlation.
    fn image_a_edited() -> Vec<u8> {
        png_bytes(RgbImage::from_fn(96, 64, |x, _| {
            let v = ((x * 255 / 96) as u8).saturating_add(10);
            Rgb([v, v, v])
        }))
    }

    /// Vertical gradient: exactly uncorrelated with A's horizontal one.
    fn image_b() -> Vec<u8> {
        png_bytes(RgbImage::from_fn(96, 64, |_, y| {
            let v = (y * 255 / 64) as u8;
            Rgb([v, v, v])
        }))
    }

    fn setup(dir: &std::path::Path) -> (RegistrationGate, Ledger) {
        let gate = RegistrationGate::new(
            ImageStore::new(dir.join("images")),
            similarity::DEFAULT_THRESHOLD,
        );
        let ledger = Ledger::load(dir.join("chain.json")).unwrap();
        (gate, ledger)
    }

    #[test]
    fn register_then_exact_duplicate_then_unrelated() {
        let dir = tempdir().unwrap();
        let (gate, mut ledger) = setup(dir.path());

        let block = gate.register(&image_a(), "Alice", &mut ledger).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.data.owner, "Alice");
        assert_eq!(ledger.len(), 2);
        assert!(ledger.validate());

        match gate.register(&image_a(), "Mallory", &mut ledger) {
            Err(RegisterError::Duplicate(dup)) => {
                assert!(dup.is_exact());
                assert_eq!(dup.block().index, 1);
            }
            other => panic!("expected exact duplicate, got {other:?}"),
        }
        assert_eq!(ledger.len(), 2);

        let block = gate.register(&image_b(), "Bob", &mut ledger).unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(ledger.len(), 3);
        assert!(ledger.validate());
    }

    #[test]
    fn near_duplicate_is_rejected_with_matched_block() {
        let dir = tempdir().unwrap();
        let (gate, mut ledger) = setup(dir.path());

        gate.register(&image_a(), "Alice", &mut ledger).unwrap();
        match gate.register(&image_a_edited(), "Mallory", &mut ledger) {
            Err(RegisterError::Duplicate(dup)) => {
                assert!(!dup.is_exact());
                assert_eq!(dup.block().data.owner, "Alice");
            }
            other => panic!("expected near duplicate, got {other:?}"),
        }
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn check_duplicate_does_not_mutate() {
        let dir = tempdir().unwrap();
        let (gate, mut ledger) = setup(dir.path());
        gate.register(&image_a(), "Alice", &mut ledger).unwrap();

        let dup = gate.check_duplicate(&image_a(), &ledger).unwrap();
        assert!(dup.unwrap().is_exact());
        let clean = gate.check_duplicate(&image_b(), &ledger).unwrap();
        assert!(clean.is_none());
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn missing_artifact_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let (gate, mut ledger) = setup(dir.path());
        let block = gate.register(&image_a(), "Alice", &mut ledger).unwrap();

        let name = block.data.filename.as_deref().unwrap();
        std::fs::remove_file(dir.path().join("images").join(name)).unwrap();

        // The edited copy would match block 1, but its artifact is gone, so
        // the scan skips it and registration goes through.
        let block = gate
            .register(&image_a_edited(), "Mallory", &mut ledger)
            .unwrap();
        assert_eq!(block.index, 2);
    }

    #[test]
    fn undecodable_upload_is_a_decode_error() {
        let dir = tempdir().unwrap();
        let (gate, mut ledger) = setup(dir.path());
        match gate.register(b"not an image", "Alice", &mut ledger) {
            Err(RegisterError::Decode(_)) => {}
            other => panic!("expected decode error, got {other:?}"),
        }
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn failed_save_rolls_back_the_append() {
        let dir = tempdir().unwrap();
        // A regular file where the ledger's parent directory should be
        // makes every save fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let gate = RegistrationGate::new(
            ImageStore::new(dir.path().join("images")),
            similarity::DEFAULT_THRESHOLD,
        );
        let mut ledger = Ledger::load(blocker.join("chain.json")).unwrap();

        match gate.register(&image_a(), "Alice", &mut ledger) {
            Err(RegisterError::Other(_)) => {}
            other => panic!("expected persistence failure, got {other:?}"),
        }
        // The rejected block must not linger in memory, or a later
        // successful registration would persist it.
        assert_eq!(ledger.len(), 1);
        assert!(ledger.validate());
    }

    #[test]
    fn registered_chain_survives_reload() {
        let dir = tempdir().unwrap();
        let (gate, mut ledger) = setup(dir.path());
        gate.register(&image_a(), "Alice", &mut ledger).unwrap();
        gate.register(&image_b(), "Bob", &mut ledger).unwrap();

        let reloaded = Ledger::load(dir.path().join("chain.json")).unwrap();
        assert_eq!(reloaded.blocks(), ledger.blocks());
        assert!(reloaded.validate());
    }
}
