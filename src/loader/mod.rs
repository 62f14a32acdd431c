// Rule set loading and validation

pub mod rule_loader;
