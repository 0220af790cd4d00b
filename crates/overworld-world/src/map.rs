//! Tile maps and the hierarchical map tree.
//!
//! Tile kinds: 0=grass, 1=wall, 2=water, 3=door, 4=floor. Walkability is a
//! property of the tile kind alone; agents are tracked separately.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAP_WIDTH: u32 = 20;
pub const DEFAULT_MAP_HEIGHT: u32 = 15;
pub const TILE_SIZE: u32 = 32;

pub const TILE_GRASS: u8 = 0;
pub const TILE_WALL: u8 = 1;
pub const TILE_WATER: u8 = 2;
pub const TILE_DOOR: u8 = 3;
pub const TILE_FLOOR: u8 = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileMap {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    /// Row-major: `tiles[y][x]`.
    pub tiles: Vec<Vec<u8>>,
}

impl TileMap {
    /// Out-of-bounds reads as wall.
    pub fn tile(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return TILE_WALL;
        }
        self.tiles[y as usize][x as usize]
    }

    pub fn is_walkable(&self, x: u32, y: u32) -> bool {
        matches!(self.tile(x, y), TILE_GRASS | TILE_DOOR | TILE_FLOOR)
    }
}

/// The overworld shown before any realm is linked: a bordered grass field
/// with a pond and a few wall obstacles.
pub fn default_map() -> TileMap {
    let w = DEFAULT_MAP_WIDTH;
    let h = DEFAULT_MAP_HEIGHT;
    let mut tiles = Vec::with_capacity(h as usize);
    for y in 0..h {
        let mut row = Vec::with_capacity(w as usize);
        for x in 0..w {
            let tile = if y == 0 || y == h - 1 || x == 0 || x == w - 1 {
                TILE_WALL
            } else if (10..=12).contains(&x) && (6..=8).contains(&y) {
                TILE_WATER
            } else if (x == 5 && y == 4)
                || (x == 5 && y == 5)
                || (x == 14 && y == 10)
                || (x == 15 && y == 10)
            {
                TILE_WALL
            } else {
                TILE_GRASS
            };
            row.push(tile);
        }
        tiles.push(row);
    }
    TileMap { width: w, height: h, tile_size: TILE_SIZE, tiles }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    File,
    Config,
    Doc,
    QuestMarker,
    Sign,
    NavDoor,
    NavBack,
}

/// An interactable placed on a map: a file, a door into a subfolder, etc.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub x: u32,
    pub y: u32,
    pub label: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MapObject {
    /// The full repo-relative path recorded at generation time, if any.
    pub fn full_path(&self) -> Option<&str> {
        self.metadata.get("full_path").and_then(|v| v.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapNodeKind {
    Folder,
    File,
}

/// One node of the hierarchical map tree rooted at the linked repository.
/// Maps and objects are generated lazily, so both are optional.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapNode {
    pub name: String,
    /// Slash-joined path from the root; empty for the root itself.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: MapNodeKind,
    #[serde(default)]
    pub children: Vec<MapNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<TileMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<MapObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_position: Option<Position>,
}

impl MapNode {
    /// Resolve a slash path relative to this node. Empty path is this node.
    pub fn resolve(&self, path: &str) -> Option<&MapNode> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for part in path.split('/') {
            current = current.children.iter().find(|c| c.name == part)?;
        }
        Some(current)
    }

    pub fn resolve_mut(&mut self, path: &str) -> Option<&mut MapNode> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for part in path.split('/') {
            current = current.children.iter_mut().find(|c| c.name == part)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_dimensions_and_border() {
        let map = default_map();
        assert_eq!(map.width, 20);
        assert_eq!(map.height, 15);
        for x in 0..map.width {
            assert_eq!(map.tile(x, 0), TILE_WALL);
            assert_eq!(map.tile(x, map.height - 1), TILE_WALL);
        }
        for y in 0..map.height {
            assert_eq!(map.tile(0, y), TILE_WALL);
            assert_eq!(map.tile(map.width - 1, y), TILE_WALL);
        }
    }

    #[test]
    fn default_map_has_pond_and_obstacles() {
        let map = default_map();
        assert_eq!(map.tile(11, 7), TILE_WATER);
        assert_eq!(map.tile(5, 4), TILE_WALL);
        assert_eq!(map.tile(15, 10), TILE_WALL);
        assert_eq!(map.tile(2, 2), TILE_GRASS);
    }

    #[test]
    fn walkability_follows_tile_kind() {
        let map = default_map();
        assert!(map.is_walkable(2, 2));
        assert!(!map.is_walkable(0, 0));
        assert!(!map.is_walkable(11, 7));
        // Out of bounds reads as wall.
        assert!(!map.is_walkable(999, 2));
    }

    #[test]
    fn map_node_resolution() {
        let tree = MapNode {
            name: "repo".into(),
            path: String::new(),
            kind: MapNodeKind::Folder,
            children: vec![MapNode {
                name: "src".into(),
                path: "src".into(),
                kind: MapNodeKind::Folder,
                children: vec![MapNode {
                    name: "main.rs".into(),
                    path: "src/main.rs".into(),
                    kind: MapNodeKind::File,
                    children: vec![],
                    map: None,
                    objects: None,
                    entry_position: None,
                }],
                map: None,
                objects: None,
                entry_position: None,
            }],
            map: None,
            objects: None,
            entry_position: None,
        };

        assert_eq!(tree.resolve("").unwrap().name, "repo");
        assert_eq!(tree.resolve("src").unwrap().name, "src");
        assert_eq!(tree.resolve("src/main.rs").unwrap().name, "main.rs");
        assert!(tree.resolve("src/missing.rs").is_none());
        assert!(tree.resolve("docs").is_none());
    }
}
