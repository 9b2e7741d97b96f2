pub mod creds;
pub mod facade;
pub mod provider;
