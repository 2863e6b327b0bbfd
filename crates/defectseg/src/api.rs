//! High-level segmentation API.
//!
//! [`Segmenter`] is the process context: it owns the compute engine, the bound
//! weights and the execution plan. Build it once, segment many images, and
//! drop it to release everything.

use std::path::Path;

use crate::config::{InputNormalization, SegmentConfig};
use crate::engine::{ComputeEngine, CpuEngine, EngineError};
use crate::image::{letterbox, ImageError, PixelBuffer, Shape};
use crate::threshold::{self, Mask, ThresholdError};
use crate::topology::{ExecutionPlan, Topology, TopologyError};
use crate::weights::{GgufFile, ModelWeights, WeightError, WeightSource};

/// Any failure while building a [`Segmenter`] or processing one image.
#[derive(Debug)]
pub enum SegmentError {
    Config(String),
    /// Image with zero width or height.
    EmptyImage { shape: Shape },
    Image(ImageError),
    Topology(TopologyError),
    Weights(WeightError),
    Engine(EngineError),
    Threshold(ThresholdError),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::EmptyImage { shape } => write!(f, "cannot segment an empty {shape} image"),
            Self::Image(e) => write!(f, "{e}"),
            Self::Topology(e) => write!(f, "{e}"),
            Self::Weights(e) => write!(f, "{e}"),
            Self::Engine(e) => write!(f, "inference failed: {e}"),
            Self::Threshold(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(_) | Self::EmptyImage { .. } => None,
            Self::Image(e) => Some(e),
            Self::Topology(e) => Some(e),
            Self::Weights(e) => Some(e),
            Self::Engine(e) => Some(e),
            Self::Threshold(e) => Some(e),
        }
    }
}

impl From<ImageError> for SegmentError {
    fn from(e: ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<TopologyError> for SegmentError {
    fn from(e: TopologyError) -> Self {
        Self::Topology(e)
    }
}

impl From<WeightError> for SegmentError {
    fn from(e: WeightError) -> Self {
        Self::Weights(e)
    }
}

impl From<EngineError> for SegmentError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ThresholdError> for SegmentError {
    fn from(e: ThresholdError) -> Self {
        Self::Threshold(e)
    }
}

/// Primary segmentation interface.
///
/// # Examples
///
/// ```no_run
/// use defectseg::{image::io, SegmentConfig, Segmenter};
/// use std::path::Path;
///
/// let segmenter =
///     Segmenter::from_model_file(Path::new("modelunet.gguf"), SegmentConfig::default()).unwrap();
/// let image = io::load_rgb(Path::new("part.png")).unwrap();
/// let mask = segmenter.segment(&image).unwrap();
/// println!("defect coverage {:.2}%", 100.0 * mask.coverage());
/// ```
pub struct Segmenter<E: ComputeEngine = CpuEngine> {
    config: SegmentConfig,
    topology: &'static Topology,
    plan: ExecutionPlan,
    weights: ModelWeights,
    engine: E,
}

impl Segmenter<CpuEngine> {
    /// Start the CPU engine and bind weights from a GGUF container.
    pub fn from_model_file(path: &Path, config: SegmentConfig) -> Result<Self, SegmentError> {
        config.validate().map_err(SegmentError::Config)?;
        let engine = CpuEngine::new(&config.engine)?;
        let file = GgufFile::open(path)?;
        Self::with_engine(engine, &file, config)
    }
}

impl<E: ComputeEngine> Segmenter<E> {
    /// Build the plan and bind weights for the reference topology.
    ///
    /// Fails if any tensor the topology names is missing from `source`.
    pub fn with_engine(
        engine: E,
        source: &dyn WeightSource,
        config: SegmentConfig,
    ) -> Result<Self, SegmentError> {
        config.validate().map_err(SegmentError::Config)?;
        let topology = Topology::reference();
        let plan = topology.build_plan()?;
        let weights = ModelWeights::bind(topology, source)?;
        tracing::info!(
            engine = engine.name(),
            topology = topology.name,
            nodes = plan.len(),
            threshold = config.threshold,
            "segmenter ready"
        );
        Ok(Self {
            config,
            topology,
            plan,
            weights,
            engine,
        })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        self.topology
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Change the mask threshold; the plan and weights are unaffected.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<(), SegmentError> {
        if !threshold.is_finite() {
            return Err(SegmentError::Config("threshold must be finite".to_string()));
        }
        self.config.threshold = threshold;
        Ok(())
    }

    /// Normalize and letterbox `image` into the network input tensor.
    pub fn prepare_input(&self, image: &PixelBuffer) -> PixelBuffer {
        let (w, h) = self.topology.input.spatial();
        let pad = self.config.pad_value;
        match self.config.input_normalization {
            InputNormalization::Raw => letterbox(image, w, h, pad),
            norm => letterbox(&image.scaled(norm.factor()), w, h, pad),
        }
    }

    /// Probability map for `image`, shaped like the network output.
    pub fn predict(&self, image: &PixelBuffer) -> Result<PixelBuffer, SegmentError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(SegmentError::EmptyImage {
                shape: image.shape(),
            });
        }
        let input = self.prepare_input(image);
        let probabilities =
            self.engine
                .execute(&self.plan, self.topology, &self.weights, &input)?;
        Ok(probabilities)
    }

    /// Binary defect mask for `image`.
    pub fn segment(&self, image: &PixelBuffer) -> Result<Mask, SegmentError> {
        let probabilities = self.predict(image)?;
        let mask = threshold::threshold(
            &probabilities,
            self.topology.output,
            self.config.threshold,
            self.config.mask,
        )?;
        tracing::debug!(
            source = %image.shape(),
            coverage = mask.coverage(),
            "image segmented"
        );
        Ok(mask)
    }
}

impl<E: ComputeEngine> Drop for Segmenter<E> {
    fn drop(&mut self) {
        tracing::debug!(engine = self.engine.name(), "segmenter released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{gray_image, synthetic_weights, PassthroughEngine};
    use crate::weights::InMemoryWeights;

    fn passthrough(threshold: f32) -> Segmenter<PassthroughEngine> {
        let source = synthetic_weights(Topology::reference());
        Segmenter::with_engine(
            PassthroughEngine,
            &source,
            SegmentConfig {
                threshold,
                ..SegmentConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn threshold_above_one_gives_all_background() {
        let mask = passthrough(1.5).segment(&gray_image(224, 224, 128.0)).unwrap();
        assert_eq!((mask.width(), mask.height()), (224, 224));
        assert!(mask.buffer().data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn threshold_below_zero_gives_all_foreground() {
        let mask = passthrough(-0.5).segment(&gray_image(224, 224, 128.0)).unwrap();
        assert!(mask.buffer().data().iter().all(|&v| v == 255.0));
    }

    #[test]
    fn letterbox_padding_reaches_the_mask() {
        // 224x112 content sits between two 56-row bands of 0.5 / 255.
        let s = passthrough(0.1);
        let mask = s.segment(&gray_image(448, 224, 255.0)).unwrap();
        let buf = mask.buffer();
        assert!(buf.row(0, 0).iter().all(|&v| v == 0.0));
        assert!(buf.row(0, 112).iter().all(|&v| v == 255.0));
        assert!(buf.row(0, 223).iter().all(|&v| v == 0.0));
        assert_eq!(mask.coverage(), 0.5);
    }

    #[test]
    fn prepare_input_applies_normalization() {
        let source = synthetic_weights(Topology::reference());
        let s = Segmenter::with_engine(
            PassthroughEngine,
            &source,
            SegmentConfig {
                input_normalization: InputNormalization::Unit,
                ..SegmentConfig::default()
            },
        )
        .unwrap();
        let input = s.prepare_input(&gray_image(10, 10, 255.0));
        assert_eq!(input.shape(), Shape::new(224, 224, 3));
        assert!(input.data().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn missing_weights_abort_construction() {
        let err = Segmenter::with_engine(
            PassthroughEngine,
            &InMemoryWeights::new(),
            SegmentConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SegmentError::Weights(WeightError::MissingTensor { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Segmenter::with_engine(
            PassthroughEngine,
            &synthetic_weights(Topology::reference()),
            SegmentConfig {
                jpeg_quality: 0,
                ..SegmentConfig::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, SegmentError::Config(_)));
    }

    struct WrongShapeEngine;

    impl ComputeEngine for WrongShapeEngine {
        fn execute(
            &self,
            _plan: &ExecutionPlan,
            _topology: &Topology,
            _weights: &ModelWeights,
            _input: &PixelBuffer,
        ) -> Result<PixelBuffer, EngineError> {
            Ok(PixelBuffer::new(112, 112, 1))
        }

        fn name(&self) -> &str {
            "wrong-shape"
        }
    }

    #[test]
    fn output_shape_mismatch_is_fatal() {
        let s = Segmenter::with_engine(
            WrongShapeEngine,
            &synthetic_weights(Topology::reference()),
            SegmentConfig::default(),
        )
        .unwrap();
        let err = s.segment(&gray_image(50, 50, 0.0)).unwrap_err();
        assert!(matches!(err, SegmentError::Threshold(_)));
    }

    #[test]
    fn zero_area_image_is_rejected() {
        let err = passthrough(0.5)
            .segment(&PixelBuffer::new(0, 10, 3))
            .unwrap_err();
        assert!(matches!(err, SegmentError::EmptyImage { .. }));
    }

    #[test]
    fn from_model_file_runs_cpu_engine() {
        use crate::test_utils::SYNTHETIC_LOGIT_BIAS;
        use crate::weights::{GgufWriter, WeightSource};

        let topology = Topology::reference();
        let source = synthetic_weights(topology);
        let mut writer = GgufWriter::new().architecture("unet");
        let mut names: Vec<&str> = source.names().collect();
        names.sort_unstable();
        for name in names {
            writer = writer.tensor_f32(name, &source.fetch(name).unwrap());
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modelunet.gguf");
        writer.write(&path).unwrap();

        let config = SegmentConfig {
            threshold: 0.5,
            engine: crate::engine::EngineConfig {
                threads: Some(2),
                ..Default::default()
            },
            ..SegmentConfig::default()
        };
        let s = Segmenter::from_model_file(&path, config).unwrap();
        let probs = s.predict(&gray_image(64, 32, 40.0)).unwrap();
        let expected = 1.0 / (1.0 + (-SYNTHETIC_LOGIT_BIAS).exp());
        assert!(probs.data().iter().all(|&p| (p - expected).abs() < 1e-6));
        // sigmoid(0.25) > 0.5, so every pixel is foreground.
        assert_eq!(s.segment(&gray_image(64, 32, 40.0)).unwrap().coverage(), 1.0);
    }
}
