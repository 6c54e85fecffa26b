pub mod aws_regions;
pub mod clients;
pub mod credentials;
