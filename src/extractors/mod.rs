pub mod tenant;

pub use tenant::RequestHost;
