//! Face detection and recognition capabilities.
//!
//! The algorithms themselves live behind two traits. A [`Capabilities`] value
//! is built once at startup and shared read-only by every stream: the
//! recognizer and the identity map are used through `&self`, while detectors
//! are created per stream from a shared provider because cascade evaluation
//! needs scratch state.

pub mod identity;
#[cfg(feature = "opencv")]
pub mod opencv;

use std::sync::Arc;

use image::GrayImage;
#[cfg(not(feature = "opencv"))]
use tracing::warn;

pub use identity::IdentityMap;

use crate::error::VisionError;
use crate::{Config, DetectionConfig};

/// Label used for faces that are not confidently matched to a known identity.
pub const UNKNOWN: &str = "unknown";

/// A face region in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Detection tuning constants, passed through to the detector unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub scale_factor: f64,
    pub min_neighbors: i32,
    pub min_size: u32,
}

impl From<&DetectionConfig> for DetectionParams {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            min_size: config.min_size,
        }
    }
}

/// Locates faces in a single-channel frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>, VisionError>;
}

/// Creates one detector per stream.
pub trait DetectorProvider: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceDetector>, VisionError>;
}

impl<F> DetectorProvider for F
where
    F: Fn() -> Result<Box<dyn FaceDetector>, VisionError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn FaceDetector>, VisionError> {
        self()
    }
}

/// Raw output of the recognition capability. Lower distance is a better match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recognition {
    pub identity: Option<i32>,
    pub distance: f64,
}

/// Classifies a cropped gray face region against the trained model.
pub trait FaceRecognizer: Send + Sync {
    fn predict(&self, region: &GrayImage) -> Result<Recognition, VisionError>;
}

/// Detector used when no detection backend is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDetection;

impl FaceDetector for NoDetection {
    fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<BoundingBox>, VisionError> {
        Ok(Vec::new())
    }
}

/// Recognizer that never matches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecognition;

impl FaceRecognizer for NoRecognition {
    fn predict(&self, _region: &GrayImage) -> Result<Recognition, VisionError> {
        Ok(Recognition {
            identity: None,
            distance: f64::INFINITY,
        })
    }
}

/// Final label for one face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub name: String,
    /// `round(100 - distance)`, clamped to 0..=100.
    pub confidence: i64,
    pub recognized: bool,
}

/// Resolve a recognition into a display label.
///
/// A face is recognized only when its distance is under `threshold` and its
/// id is present in `identities`; everything else is [`UNKNOWN`].
pub fn classify(
    recognition: &Recognition,
    threshold: f64,
    identities: &IdentityMap,
) -> Classification {
    let confidence = (100.0 - recognition.distance).round().clamp(0.0, 100.0) as i64;
    let name = recognition
        .identity
        .filter(|_| recognition.distance < threshold)
        .and_then(|id| identities.get(id));

    match name {
        Some(name) => Classification {
            name: name.to_string(),
            confidence,
            recognized: true,
        },
        None => Classification {
            name: UNKNOWN.to_string(),
            confidence,
            recognized: false,
        },
    }
}

/// Everything the processors need from the vision side, loaded once.
pub struct Capabilities {
    pub detectors: Arc<dyn DetectorProvider>,
    pub recognizer: Arc<dyn FaceRecognizer>,
    pub identities: Arc<IdentityMap>,
    pub threshold: f64,
}

impl Capabilities {
    pub fn new(
        detectors: Arc<dyn DetectorProvider>,
        recognizer: Arc<dyn FaceRecognizer>,
        identities: Arc<IdentityMap>,
        threshold: f64,
    ) -> Self {
        Self {
            detectors,
            recognizer,
            identities,
            threshold,
        }
    }

    /// No faces are ever found. Streams still flow and get FPS overlays.
    pub fn disabled(identities: Arc<IdentityMap>, threshold: f64) -> Self {
        let detectors = || -> Result<Box<dyn FaceDetector>, VisionError> { Ok(Box::new(NoDetection)) };
        Self::new(
            Arc::new(detectors),
            Arc::new(NoRecognition),
            identities,
            threshold,
        )
    }

    /// Load the configured backend.
    pub fn load(config: &Config, identities: Arc<IdentityMap>) -> Result<Self, VisionError> {
        #[cfg(feature = "opencv")]
        {
            opencv::load(config, identities)
        }
        #[cfg(not(feature = "opencv"))]
        {
            warn!(
                cascade = %config.detection.cascade.display(),
                model = %config.recognition.model.display(),
                "built without the `opencv` feature, face detection is disabled"
            );
            Ok(Self::disabled(identities, config.recognition.threshold))
        }
    }
}
