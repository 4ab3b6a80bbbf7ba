//! Generated protobuf modules
//!
//! build.rs compiles every .proto under `protos/`; prost emits one file per
//! package (`meshtastic.rs`) which is included here.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes so unused parts of the
    //! schema do not produce dead_code noise.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
