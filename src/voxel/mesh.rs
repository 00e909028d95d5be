//! Isosurface extraction from density grids
//!
//! Marching tetrahedra: every cube of the grid is split into six tetrahedra
//! sharing the cube's main diagonal (corner 0 to corner 7). Each tetrahedron
//! emits zero, one or two triangles, so no case tables are needed and the
//! surface is closed across cube faces.
//!
//! The output depends only on the sample values, so two chunks holding equal
//! samples on a shared face emit coincident vertices along that face.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::core::types::Vec3;
use crate::math::Aabb;
use crate::voxel::density::DensityGrid;

/// Cube corner `i` sits at `(i & 1, (i >> 1) & 1, (i >> 2) & 1)`.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 3, 2, 7],
    [0, 2, 6, 7],
    [0, 6, 4, 7],
    [0, 4, 5, 7],
    [0, 5, 1, 7],
];

/// Vertex layout shared with the renderer
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Chunk-local position in world units
    pub position: [f32; 3],
    /// Unit normal pointing from solid to empty
    pub normal: [f32; 3],
}

/// Triangle mesh of one chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkMesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
}

impl ChunkMesh {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Bounds of all vertices, or `None` for an empty mesh.
    pub fn bounds(&self) -> Option<Aabb> {
        let mut iter = self.vertices.iter().map(|v| Vec3::from(v.position));
        let first = iter.next()?;
        Some(iter.fold(Aabb::new(first, first), |acc, p| acc.including(p)))
    }

    /// Raw vertex bytes for GPU upload
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }
}

/// Stateless extractor bound to a voxel size.
#[derive(Clone, Copy, Debug)]
pub struct IsosurfaceExtractor {
    pub voxel_size: f32,
}

impl IsosurfaceExtractor {
    pub fn new(voxel_size: f32) -> Self {
        Self { voxel_size }
    }

    pub fn extract(&self, grid: &DensityGrid) -> ChunkMesh {
        extract(grid, self.voxel_size)
    }
}

/// Extract the surface where density crosses the grid's surface level.
pub fn extract(grid: &DensityGrid, voxel_size: f32) -> ChunkMesh {
    let mut builder = MeshBuilder {
        grid,
        voxel_size,
        iso: grid.surface_level(),
        mesh: ChunkMesh::default(),
        edge_cache: HashMap::new(),
    };

    let n = grid.resolution();
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                builder.process_cube(x, y, z);
            }
        }
    }

    builder.mesh
}

struct MeshBuilder<'a> {
    grid: &'a DensityGrid,
    voxel_size: f32,
    iso: f32,
    mesh: ChunkMesh,
    /// Ordered (low, high) sample index pair -> vertex index
    edge_cache: HashMap<(usize, usize), u32>,
}

impl MeshBuilder<'_> {
    fn process_cube(&mut self, x: u32, y: u32, z: u32) {
        let mut corners = [0usize; 8];
        let mut inside_mask = 0u8;
        for (i, corner) in corners.iter_mut().enumerate() {
            let (cx, cy, cz) = (x + (i as u32 & 1), y + ((i as u32 >> 1) & 1), z + ((i as u32 >> 2) & 1));
            *corner = self.grid.index(cx, cy, cz);
            if self.grid.is_active(cx, cy, cz) {
                inside_mask |= 1 << i;
            }
        }
        if inside_mask == 0 || inside_mask == 0xFF {
            return;
        }

        for tet in &TETRAHEDRA {
            self.process_tetrahedron(tet.map(|c| corners[c]));
        }
    }

    fn process_tetrahedron(&mut self, tet: [usize; 4]) {
        let states = self.grid.active_states();
        let (inside, outside): (Vec<usize>, Vec<usize>) =
            tet.into_iter().partition(|&s| states[s]);

        match inside.len() {
            1 | 3 => {
                let (apex, base) = if inside.len() == 1 {
                    (inside[0], &outside)
                } else {
                    (outside[0], &inside)
                };
                let v = [
                    self.edge_vertex(apex, base[0]),
                    self.edge_vertex(apex, base[1]),
                    self.edge_vertex(apex, base[2]),
                ];
                self.emit_triangle(v, &inside, &outside);
            }
            2 => {
                let (a, b) = (inside[0], inside[1]);
                let (c, d) = (outside[0], outside[1]);
                // a-c, a-d, b-d, b-c walk the quad's perimeter
                let q = [
                    self.edge_vertex(a, c),
                    self.edge_vertex(a, d),
                    self.edge_vertex(b, d),
                    self.edge_vertex(b, c),
                ];
                self.emit_triangle([q[0], q[1], q[2]], &inside, &outside);
                self.emit_triangle([q[0], q[2], q[3]], &inside, &outside);
            }
            _ => {}
        }
    }

    /// Wind the triangle so its face normal points from the solid corners
    /// toward the empty ones.
    fn emit_triangle(&mut self, v: [u32; 3], inside: &[usize], outside: &[usize]) {
        if v[0] == v[1] || v[1] == v[2] || v[0] == v[2] {
            return;
        }
        let p = v.map(|i| Vec3::from(self.mesh.vertices[i as usize].position));
        let face_normal = (p[1] - p[0]).cross(p[2] - p[0]);
        let outward = self.centroid(outside) - self.centroid(inside);
        if face_normal.dot(outward) < 0.0 {
            self.mesh.indices.extend_from_slice(&[v[0], v[2], v[1]]);
        } else {
            self.mesh.indices.extend_from_slice(&v);
        }
    }

    fn centroid(&self, samples: &[usize]) -> Vec3 {
        let sum: Vec3 = samples.iter().map(|&s| self.sample_pos(s)).sum();
        sum / samples.len() as f32
    }

    fn sample_pos(&self, index: usize) -> Vec3 {
        let (x, y, z) = self.grid.position(index);
        Vec3::new(x as f32, y as f32, z as f32)
    }

    fn edge_vertex(&mut self, s0: usize, s1: usize) -> u32 {
        let key = (s0.min(s1), s0.max(s1));
        if let Some(&v) = self.edge_cache.get(&key) {
            return v;
        }

        let (lo, hi) = key;
        let d_lo = self.grid.get_index(lo);
        let d_hi = self.grid.get_index(hi);
        let denom = d_hi - d_lo;
        let t = if denom.abs() > f32::EPSILON {
            ((self.iso - d_lo) / denom).clamp(0.0, 1.0)
        } else {
            0.5
        };

        let p_lo = self.sample_pos(lo);
        let p_hi = self.sample_pos(hi);
        let position = (p_lo + (p_hi - p_lo) * t) * self.voxel_size;

        let g_lo = self.gradient(lo);
        let g_hi = self.gradient(hi);
        let normal = -(g_lo + (g_hi - g_lo) * t).normalize_or_zero();

        let index = self.mesh.vertices.len() as u32;
        self.mesh.vertices.push(MeshVertex {
            position: position.to_array(),
            normal: normal.to_array(),
        });
        self.edge_cache.insert(key, index);
        index
    }

    /// Density gradient by central differences (one-sided on the border).
    fn gradient(&self, index: usize) -> Vec3 {
        let (x, y, z) = self.grid.position(index);
        let max = self.grid.resolution();
        let axis = |p: u32, f: &dyn Fn(u32) -> f32| -> f32 {
            let lo = p.saturating_sub(1);
            let hi = (p + 1).min(max);
            (f(hi) - f(lo)) / (hi - lo) as f32
        };
        Vec3::new(
            axis(x, &|i| self.grid.get(i, y, z)),
            axis(y, &|i| self.grid.get(x, i, z)),
            axis(z, &|i| self.grid.get(x, y, i)),
        )
    }
}
