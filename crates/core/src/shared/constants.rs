pub const FACE_MODEL_NAME: &str = "yolo11n-pose_widerface.onnx";
pub const OBJECT_MODEL_NAME: &str = "yolo11n.onnx";
pub const EMBEDDING_MODEL_NAME: &str = "w600k_r50.onnx";
pub const SPOOF_MODEL_NAME: &str = "minifasnet_v2.onnx";

/// COCO class index of "cell phone".
pub const PHONE_CLASS_ID: usize = 67;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Root directory for evidence files, relative to the working directory.
pub const DEFAULT_EVIDENCE_DIR: &str = "Actions";

/// Separator between the timestamp, action and reason in evidence file names.
pub const EVIDENCE_NAME_SEPARATOR: &str = "___";

/// `DD_MM_YYYY-HH_MM`
pub const EVIDENCE_TIMESTAMP_FORMAT: &str = "%d_%m_%Y-%H_%M";
