//! Directory service client: volume lookup and location caching

pub mod cache;
pub mod lookup;

pub use cache::VidCache;
pub use lookup::{DirectoryLookup, DirectoryResolver, HttpDirectoryClient, Location, LookupResult};
