// Append-only JSONL trace tail

pub mod recorder;
