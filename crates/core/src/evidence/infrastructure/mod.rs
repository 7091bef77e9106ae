pub mod evidence_writer;
pub mod frame_annotator;
