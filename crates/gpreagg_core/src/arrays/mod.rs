//! Row and buffer formats shared by the host and the device.

pub mod chunk;
pub mod datatype;
pub mod descriptor;
pub mod hash_slot;
pub mod scalar;
pub mod slot_store;
