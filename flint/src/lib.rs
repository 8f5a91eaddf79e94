// A table engine with copy-on-write B-trees:
// 1. Keys map to tags, split into components when they outgrow an item
// 2. Writers never overwrite a block from the last revision
// 3. A commit syncs the data file, then writes the older of the two bases
// 4. Readers see the revision they opened until a writer reuses its blocks

pub mod config;
pub mod simulation;
pub mod storage;

mod e2e_tests;
