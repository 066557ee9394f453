//! Haar-cascade detection and LBPH recognition through OpenCV.

use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use opencv::core::{Mat, Ptr, Rect, Size, Vector};
use opencv::face::LBPHFaceRecognizer;
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use tracing::info;

use crate::error::VisionError;
use crate::vision::{
    BoundingBox, Capabilities, DetectionParams, FaceDetector, FaceRecognizer, IdentityMap,
    Recognition,
};
use crate::Config;

/// Load the cascade and the trained model named in `config`.
pub fn load(config: &Config, identities: Arc<IdentityMap>) -> Result<Capabilities, VisionError> {
    let cascade = config.detection.cascade.clone();
    let params = DetectionParams::from(&config.detection);

    // Fail at startup rather than once per stream.
    CascadeDetector::open(&cascade, params)?;
    let recognizer = LbphRecognizer::open(&config.recognition.model)?;
    info!(
        cascade = %cascade.display(),
        model = %config.recognition.model.display(),
        identities = identities.len(),
        "opencv face pipeline loaded"
    );

    let detectors = move || -> Result<Box<dyn FaceDetector>, VisionError> {
        Ok(Box::new(CascadeDetector::open(&cascade, params)?))
    };
    Ok(Capabilities::new(
        Arc::new(detectors),
        Arc::new(recognizer),
        identities,
        config.recognition.threshold,
    ))
}

fn load_error(what: &'static str, path: &Path, reason: impl ToString) -> VisionError {
    VisionError::Load {
        what,
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn to_mat(gray: &GrayImage) -> Result<Mat, opencv::Error> {
    let rows = Mat::from_slice_rows_cols(gray.as_raw(), gray.height() as usize, gray.width() as usize)?;
    rows.try_clone()
}

pub struct CascadeDetector {
    classifier: CascadeClassifier,
    params: DetectionParams,
}

impl CascadeDetector {
    pub fn open(path: &Path, params: DetectionParams) -> Result<Self, VisionError> {
        let path_str = path.to_string_lossy();
        let classifier =
            CascadeClassifier::new(&path_str).map_err(|e| load_error("cascade", path, e))?;
        if classifier.empty().map_err(|e| load_error("cascade", path, e))? {
            return Err(load_error("cascade", path, "classifier is empty"));
        }
        Ok(Self { classifier, params })
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<BoundingBox>, VisionError> {
        let detection = |e: opencv::Error| VisionError::Detection(e.to_string());
        let mat = to_mat(gray).map_err(detection)?;
        let min = self.params.min_size as i32;
        let mut faces = Vector::<Rect>::new();
        self.classifier
            .detect_multi_scale(
                &mat,
                &mut faces,
                self.params.scale_factor,
                self.params.min_neighbors,
                0,
                Size::new(min, min),
                Size::new(0, 0),
            )
            .map_err(detection)?;

        Ok(faces
            .iter()
            .map(|r| {
                BoundingBox::new(
                    r.x.max(0) as u32,
                    r.y.max(0) as u32,
                    r.width.max(0) as u32,
                    r.height.max(0) as u32,
                )
            })
            .collect())
    }
}

pub struct LbphRecognizer {
    model: Ptr<LBPHFaceRecognizer>,
}

// SAFETY: the model is only mutated while loading in `open`; afterwards it
// is used through `predict`, which is const in OpenCV and keeps no scratch
// state on the recognizer.
unsafe impl Send for LbphRecognizer {}
unsafe impl Sync for LbphRecognizer {}

impl LbphRecognizer {
    pub fn open(path: &Path) -> Result<Self, VisionError> {
        let mut model = LBPHFaceRecognizer::create(1, 8, 8, 8, f64::MAX)
            .map_err(|e| load_error("model", path, e))?;
        model
            .read(&path.to_string_lossy())
            .map_err(|e| load_error("model", path, e))?;
        Ok(Self { model })
    }
}

impl FaceRecognizer for LbphRecognizer {
    fn predict(&self, region: &GrayImage) -> Result<Recognition, VisionError> {
        let recognition = |e: opencv::Error| VisionError::Recognition(e.to_string());
        let mat = to_mat(region).map_err(recognition)?;
        let mut label = -1;
        let mut distance = f64::INFINITY;
        self.model
            .predict(&mat, &mut label, &mut distance)
            .map_err(recognition)?;
        Ok(Recognition {
            identity: (label >= 0).then_some(label),
            distance,
        })
    }
}
