//! litfetch-test-utils — PDF fixtures, in-process stand-ins for resolvers,
//! the fetcher and the catalog, and a loopback HTTP server, so acquisition
//! can be tested without network.

pub mod mocks;
pub mod pdf;
pub mod server;

pub use mocks::{FlakyCatalog, MockFetcher, MockResolver};
pub use pdf::{minimal_pdf, multi_page_pdf};
pub use server::{Route, StaticServer};
