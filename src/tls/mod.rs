pub mod cert_cache;

pub use cert_cache::{CertCache, CertDatabase, FileCertDatabase};
