pub mod checkpoint;
pub mod classification;
pub mod junction;
pub mod product;
pub mod raw_archive;

use std::collections::BTreeMap;

use crate::models::ClassificationKind;

pub use checkpoint::CheckpointRepository;
pub use classification::ClassificationRepository;
pub use junction::JunctionRepository;
pub use product::ProductRepository;
pub use raw_archive::RawArchiveRepository;

/// One repository per entity kind, built once per store.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub raw_archive: RawArchiveRepository,
    pub products: ProductRepository,
    pub classifications: BTreeMap<ClassificationKind, ClassificationRepository>,
    pub junctions: BTreeMap<ClassificationKind, JunctionRepository>,
    pub checkpoints: CheckpointRepository,
}

impl Default for Repositories {
    fn default() -> Self {
        Self {
            raw_archive: RawArchiveRepository::new(),
            products: ProductRepository::new(),
            classifications: ClassificationKind::ALL
                .into_iter()
                .map(|k| (k, ClassificationRepository::new(k)))
                .collect(),
            junctions: ClassificationKind::ALL
                .into_iter()
                .map(|k| (k, JunctionRepository::new(k)))
                .collect(),
            checkpoints: CheckpointRepository,
        }
    }
}

impl Repositories {
    pub fn classification(&self, kind: ClassificationKind) -> &ClassificationRepository {
        // Every kind is populated in `default`.
        &self.classifications[&kind]
    }

    pub fn junction(&self, kind: ClassificationKind) -> &JunctionRepository {
        &self.junctions[&kind]
    }
}
