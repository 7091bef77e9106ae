pub mod evidence_record;
