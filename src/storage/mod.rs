//! Local storage: needles, volumes, disk locations, and the store facade

pub mod disk_location;
pub mod ec_volume;
pub mod needle;
pub mod store;
pub mod volume;

pub use disk_location::DiskLocation;
pub use ec_volume::EcVolume;
pub use needle::{parse_url_path, Needle, NeedleId, Ttl, VolumeId, PAIR_NAME_PREFIX};
pub use store::{Store, StoreStatus, VolumeKind};
pub use volume::{ReplicaPlacement, Volume};
