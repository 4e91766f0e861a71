mod record_merge;
mod revision_gate;
