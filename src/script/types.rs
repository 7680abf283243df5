//! Vector types marshaled across the script boundary.
//!
//! Vectors travel as Lua array tables: `{x, y}`, `{x, y, z}`, `{x, y, z, w}`.

use serde::{Deserialize, Serialize};

/// Integer 2D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vec2i {
    pub x: i32,
    pub y: i32,
}

/// Integer 4D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vec4i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

/// Float 2D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2f {
    pub x: f32,
    pub y: f32,
}

/// Float 3D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Float 4D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec2i {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl Vec4i {
    pub fn new(x: i32, y: i32, z: i32, w: i32) -> Self {
        Self { x, y, z, w }
    }
}

impl Vec2f {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl Vec3f {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl Vec4f {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl From<[i32; 2]> for Vec2i {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Vec2i> for [i32; 2] {
    fn from(v: Vec2i) -> Self {
        [v.x, v.y]
    }
}

impl From<[i32; 4]> for Vec4i {
    fn from([x, y, z, w]: [i32; 4]) -> Self {
        Self { x, y, z, w }
    }
}

impl From<Vec4i> for [i32; 4] {
    fn from(v: Vec4i) -> Self {
        [v.x, v.y, v.z, v.w]
    }
}

impl From<[f32; 2]> for Vec2f {
    fn from([x, y]: [f32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Vec2f> for [f32; 2] {
    fn from(v: Vec2f) -> Self {
        [v.x, v.y]
    }
}

impl From<[f32; 3]> for Vec3f {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Vec3f> for [f32; 3] {
    fn from(v: Vec3f) -> Self {
        [v.x, v.y, v.z]
    }
}

impl From<[f32; 4]> for Vec4f {
    fn from([x, y, z, w]: [f32; 4]) -> Self {
        Self { x, y, z, w }
    }
}

impl From<Vec4f> for [f32; 4] {
    fn from(v: Vec4f) -> Self {
        [v.x, v.y, v.z, v.w]
    }
}
