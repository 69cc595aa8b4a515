use sqlx::SqlitePool;

pub mod acquisition;
pub mod restriction;

pub use acquisition::{AcquisitionRepo, StoredAcquisition};
pub use restriction::RestrictionRepo;

#[derive(Clone)]
pub struct Repos {
    pub restrictions: RestrictionRepo,
    pub acquisitions: AcquisitionRepo,
}

impl Repos {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            restrictions: RestrictionRepo::new(pool.clone()),
            acquisitions: AcquisitionRepo::new(pool),
        }
    }
}
