//! Named points rigidly attached to a body, used by external tools
//! (motion capture targets, IK goals).

use arbor_math::Vec3;

/// A named point fixed in a body's local frame.
#[derive(Debug, Clone)]
pub struct Marker {
    name: String,
    local_position: Vec3,
}

impl Marker {
    pub fn new(name: impl Into<String>, local_position: Vec3) -> Self {
        Self {
            name: name.into(),
            local_position,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_position(&self) -> Vec3 {
        self.local_position
    }
}
