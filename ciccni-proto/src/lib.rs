//! # ciccni Proto
//!
//! Generated Rust code from the protobuf definition of the CNI request
//! service spoken between the ciccni shim and the ciccni agent over the
//! local UNIX socket.
//!
//! Both ends of the socket are separate binaries; the field numbers and
//! error-code values in `proto/cni.proto` are part of the wire contract and
//! must not be renumbered.

// Include generated code
pub mod generated {
    pub mod ciccni {
        pub mod cni {
            pub mod v1 {
                include!("generated/ciccni.cni.v1.rs");
            }
        }
    }
}

/// CNI service types and service definitions
pub mod cni {
    pub use crate::generated::ciccni::cni::v1::cni_client::CniClient;
    pub use crate::generated::ciccni::cni::v1::cni_server::{Cni, CniServer};
    pub use crate::generated::ciccni::cni::v1::*;
}

// Re-export the protocol at the crate root for convenience.
pub use generated::ciccni::cni::v1::cni_client::CniClient;
pub use generated::ciccni::cni::v1::cni_server::{Cni, CniServer};
pub use generated::ciccni::cni::v1::*;
