//! UUID generation, isolated behind a function so tests can see the call
//! site without depending on the `uuid` crate directly.

use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
