use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::FramePair;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to prepare output directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start writer thread")]
    Spawn(#[source] std::io::Error),
}

/// Persists frame pairs to storage, off the camera callback path.
///
/// `save` hands the pair to a dedicated thread and returns immediately;
/// the stream never waits for the filesystem. Write failures are logged
/// and counted, not surfaced - persistence is fire-and-forget. Dropping
/// the writer drains and joins the thread.
pub struct ImageWriter {
    tx: Option<Sender<FramePair>>,
    worker: Option<JoinHandle<()>>,
}

impl ImageWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, WriterError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|source| WriterError::CreateDir {
            path: directory.clone(),
            source,
        })?;

        let (tx, rx) = unbounded::<FramePair>();
        let worker = thread::Builder::new()
            .name("image-writer".into())
            .spawn(move || {
                for pair in rx {
                    write_pair(&directory, &pair);
                }
                debug!("image writer drained");
            })
            .map_err(WriterError::Spawn)?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queues both frames of the pair for persistence. Never blocks.
    pub fn save(&self, pair: FramePair) {
        if let Some(tx) = &self.tx {
            if tx.send(pair).is_ok() {
                counter!("fusion.writer.queued").increment(1);
            }
        }
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("image writer thread panicked");
            }
        }
    }
}

fn write_pair(directory: &std::path::Path, pair: &FramePair) {
    let fir_path = directory.join(format!("fir_{:06}.png", pair.sequence));
    let rgb_path = directory.join(format!("rgb_{:06}.png", pair.sequence));

    for (path, frame) in [(fir_path, &pair.thermal), (rgb_path, &pair.visible)] {
        if let Err(e) = frame.as_image().save(&path) {
            counter!("fusion.writer.errors").increment(1);
            warn!(path = %path.display(), error = %e, "failed to persist frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::Frame;

    fn pair(sequence: u64) -> FramePair {
        let frame = Frame::new(RgbImage::new(2, 2));
        FramePair::new(frame.clone(), frame, sequence)
    }

    #[test]
    fn writes_both_frames_with_expected_names() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ImageWriter::new(dir.path()).unwrap();

        writer.save(pair(3));
        writer.save(pair(4));
        drop(writer); // joins the worker, so all writes are flushed

        for name in ["fir_000003.png", "rgb_000003.png", "fir_000004.png", "rgb_000004.png"] {
            assert!(dir.path().join(name).is_file(), "missing {name}");
        }
    }

    #[test]
    fn written_frames_decode_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ImageWriter::new(dir.path()).unwrap();

        let mut img = RgbImage::new(2, 2);
        img.put_pixel(1, 0, image::Rgb([200, 100, 50]));
        let frame = Frame::new(img);
        writer.save(FramePair::new(frame.clone(), frame, 0));
        drop(writer);

        let loaded = image::open(dir.path().join("rgb_000000.png")).unwrap().to_rgb8();
        assert_eq!(loaded.get_pixel(1, 0).0, [200, 100, 50]);
    }

    #[test]
    fn nested_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("captures").join("session_1");
        let writer = ImageWriter::new(&nested).unwrap();
        writer.save(pair(0));
        drop(writer);
        assert!(nested.join("fir_000000.png").is_file());
    }
}
