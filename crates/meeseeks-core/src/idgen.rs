//! Job id generation: a UUID v1 per submission when the caller does not
//! supply one, matching the original implementation's `uuid.uuid1()`.

use std::sync::OnceLock;

use uuid::Uuid;

fn node_id() -> &'static [u8; 6] {
    static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();
    NODE_ID.get_or_init(|| {
        let mut bytes = [0u8; 6];
        for b in bytes.iter_mut() {
            *b = (rand::random::<u8>() | 0x01) & 0xff;
        }
        bytes
    })
}

/// Generates a new job id.
pub fn new_job_id() -> String {
    Uuid::now_v1(node_id()).to_string()
}
