//! BIDS side of the fetal MRI pipeline: which entity tuples to run, and
//! how engine output paths map onto a derivatives tree.

pub mod description;
pub mod entities;
pub mod error;
pub mod layout;
pub mod remap;
pub mod rules;

pub use description::{check_reconstructed_dataset, write_dataset_description};
pub use entities::{enumerate, EntityCatalogue, EntityTuple, InMemoryCatalogue};
pub use error::BidsError;
pub use layout::{BidsFile, BidsLayout};
pub use remap::{Rule, RuleSet, RuleTable};
pub use rules::{
    build_bids_rules, build_static_rules, build_static_rules_with, derivatives_container,
    split_pipeline_name, BidsRuleParams, DefaultTables, Step,
};
