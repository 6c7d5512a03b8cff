//! lumen: an offline, unbiased Monte-Carlo path tracer.
//!
//! The crate exposes a host-side scene builder (meshes, instances,
//! materials, textures, lights, environment), SAH-built BVH acceleration
//! with an optional wide layout, and a progressive tile renderer that
//! accumulates pixel estimates until the caller stops asking for
//! samples.
//!
//! ```no_run
//! use lumen::{Renderer, Settings};
//!
//! let mut renderer = Renderer::new(Settings {
//!     w: 640,
//!     h: 360,
//!     ..Default::default()
//! })
//! .unwrap();
//! let scene = renderer.create_scene();
//! // ... add meshes, materials, lights, a camera ...
//! scene.finalize();
//! renderer.render_frame(&scene, 128).unwrap();
//! let pixels = renderer.pixels();
//! # let _ = pixels;
//! ```

pub mod bsdf;
pub mod bvh;
pub mod camera;
pub mod color;
pub mod lights;
pub mod math;
mod renderer;
pub mod rt;
pub mod scene;
pub mod storage;
pub mod tex;

pub use camera::{Camera, CameraDesc, CameraHandle, FilmFilter};
pub use color::TonemapMode;
pub use lights::{
    DirectionalLightDesc, DiskLightDesc, LightHandle, LineLightDesc, RectLightDesc,
    SphereLightDesc, SpotLightDesc,
};
pub use renderer::{
    Image, PostProcessOptions, RegionContext, RenderError, RenderOptions, Renderer, Settings,
};
pub use rt::{Hit, Ray};
pub use scene::env::{Environment, PHYSICAL_SKY_TEXTURE};
pub use scene::material::{MaterialHandle, PrincipledMatDesc, ShadingNode, ShadingNodeDesc};
pub use scene::mesh::{
    MeshDesc, MeshHandle, MeshInstanceHandle, ShapeDesc, Vertex, VertexLayout,
};
pub use scene::{Scene, SceneSettings};
pub use tex::{TextureDesc, TextureFormat, TextureHandle};
