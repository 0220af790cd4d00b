//! Turning a repository into walkable maps.
//!
//! [`MapGenerator`] is the seam: the hub only asks for a map tree and for a
//! node's tile map + objects, so a richer generator can be dropped in without
//! touching routing. [`GridMapGenerator`] is the deterministic built-in: a
//! bordered floor room per folder, one door object per child folder, one file
//! object per file, laid out in reading order.

use std::io;
use std::path::Path;

use overworld_world::map::{
    MapNode, MapNodeKind, MapObject, ObjectKind, Position, TileMap, TILE_DOOR, TILE_FLOOR,
    TILE_SIZE, TILE_WALL,
};

/// A generated room: tiles, placed objects, and where to stand on entry.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedMap {
    pub map: TileMap,
    pub objects: Vec<MapObject>,
    pub entry_position: Position,
}

pub trait MapGenerator: Send + Sync {
    /// Walk a real directory into a map tree. Maps are generated lazily per
    /// node, so the tree itself is cheap.
    fn build_tree(&self, root: &Path) -> io::Result<MapNode>;

    /// Tile map + objects for one folder node.
    fn generate_node_map(&self, node: &MapNode) -> GeneratedMap;
}

/// Directories that never belong on a map.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "__pycache__"];

pub struct GridMapGenerator {
    max_depth: usize,
    max_entries_per_dir: usize,
}

impl Default for GridMapGenerator {
    fn default() -> Self {
        Self { max_depth: 4, max_entries_per_dir: 40 }
    }
}

impl GridMapGenerator {
    pub fn new(max_depth: usize, max_entries_per_dir: usize) -> Self {
        Self { max_depth, max_entries_per_dir }
    }

    fn walk(&self, dir: &Path, rel_path: &str, depth: usize) -> io::Result<Vec<MapNode>> {
        if depth >= self.max_depth {
            return Ok(Vec::new());
        }

        let mut entries: Vec<(String, bool)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            entries.push((name, is_dir));
        }
        // Folders first, then files, alphabetical within each: the layout is
        // the same on every walk.
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(self.max_entries_per_dir);

        let mut children = Vec::new();
        for (name, is_dir) in entries {
            let child_rel = if rel_path.is_empty() {
                name.clone()
            } else {
                format!("{rel_path}/{name}")
            };
            let node = if is_dir {
                MapNode {
                    name: name.clone(),
                    path: child_rel.clone(),
                    kind: MapNodeKind::Folder,
                    children: self.walk(&dir.join(&name), &child_rel, depth + 1)?,
                    map: None,
                    objects: None,
                    entry_position: None,
                }
            } else {
                MapNode {
                    name,
                    path: child_rel,
                    kind: MapNodeKind::File,
                    children: Vec::new(),
                    map: None,
                    objects: None,
                    entry_position: None,
                }
            };
            children.push(node);
        }
        Ok(children)
    }
}

impl MapGenerator for GridMapGenerator {
    fn build_tree(&self, root: &Path) -> io::Result<MapNode> {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        Ok(MapNode {
            name,
            path: String::new(),
            kind: MapNodeKind::Folder,
            children: self.walk(root, "", 0)?,
            map: None,
            objects: None,
            entry_position: None,
        })
    }

    fn generate_node_map(&self, node: &MapNode) -> GeneratedMap {
        // Objects sit on every other tile of every other row, so the room
        // grows with the entry count but stays fully walkable around them.
        let count = node.children.len().max(1);
        let columns = (count as f64).sqrt().ceil() as u32;
        let columns = columns.clamp(3, 8);
        let rows = (count as u32).div_ceil(columns);

        let width = columns * 2 + 3;
        let height = rows * 2 + 5;

        let mut tiles = vec![vec![TILE_FLOOR; width as usize]; height as usize];
        for x in 0..width as usize {
            tiles[0][x] = TILE_WALL;
            tiles[height as usize - 1][x] = TILE_WALL;
        }
        for row in tiles.iter_mut() {
            row[0] = TILE_WALL;
            row[width as usize - 1] = TILE_WALL;
        }

        let entry_position = Position { x: width / 2, y: height - 3 };
        let mut objects = Vec::new();

        // Nested folders get a way back up, drawn as a door in the south wall.
        if !node.path.is_empty() {
            let door = Position { x: width / 2, y: height - 2 };
            tiles[door.y as usize][door.x as usize] = TILE_DOOR;
            let mut metadata = serde_json::Map::new();
            metadata.insert("full_path".into(), node.path.clone().into());
            objects.push(MapObject {
                id: format!("back_{}", node.path),
                kind: ObjectKind::NavBack,
                x: door.x,
                y: door.y,
                label: "..".into(),
                metadata,
            });
        }

        for (i, child) in node.children.iter().enumerate() {
            let col = (i as u32) % columns;
            let row = (i as u32) / columns;
            let x = 2 + col * 2;
            let y = 2 + row * 2;
            let mut metadata = serde_json::Map::new();
            metadata.insert("full_path".into(), child.path.clone().into());
            let (kind, id_prefix) = match child.kind {
                MapNodeKind::Folder => {
                    metadata.insert("target_path".into(), child.path.clone().into());
                    (ObjectKind::NavDoor, "door")
                }
                MapNodeKind::File => (object_kind_for_file(&child.name), "file"),
            };
            objects.push(MapObject {
                id: format!("{id_prefix}_{}", child.path),
                kind,
                x,
                y,
                label: child.name.clone(),
                metadata,
            });
        }

        GeneratedMap {
            map: TileMap { width, height, tile_size: TILE_SIZE, tiles },
            objects,
            entry_position,
        }
    }
}

fn object_kind_for_file(name: &str) -> ObjectKind {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".md") || lower.ends_with(".txt") {
        ObjectKind::Doc
    } else if lower.ends_with(".json")
        || lower.ends_with(".toml")
        || lower.ends_with(".yaml")
        || lower.ends_with(".yml")
    {
        ObjectKind::Config
    } else {
        ObjectKind::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture_repo() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("overworld-gen-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("src/api")).unwrap();
        std::fs::create_dir_all(dir.join("docs")).unwrap();
        std::fs::create_dir_all(dir.join("node_modules/junk")).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        std::fs::write(dir.join("config.toml"), "[x]").unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.join("src/api/routes.rs"), "").unwrap();
        dir
    }

    #[test]
    fn tree_walk_skips_junk_and_orders_folders_first() {
        let repo = fixture_repo();
        let generator = GridMapGenerator::default();
        let tree = generator.build_tree(&repo).unwrap();

        let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "src", "README.md", "config.toml"]);
        assert_eq!(tree.resolve("src/api/routes.rs").unwrap().kind, MapNodeKind::File);
        assert!(tree.resolve("node_modules").is_none());
        assert!(tree.resolve(".git").is_none());

        std::fs::remove_dir_all(&repo).ok();
    }

    #[test]
    fn depth_limit_prunes_the_walk() {
        let repo = fixture_repo();
        let generator = GridMapGenerator::new(1, 40);
        let tree = generator.build_tree(&repo).unwrap();

        assert!(tree.resolve("src").is_some());
        assert!(tree.resolve("src").unwrap().children.is_empty());

        std::fs::remove_dir_all(&repo).ok();
    }

    #[test]
    fn generation_is_deterministic() {
        let repo = fixture_repo();
        let generator = GridMapGenerator::default();
        let tree = generator.build_tree(&repo).unwrap();

        let a = generator.generate_node_map(&tree);
        let b = generator.generate_node_map(&tree);
        assert_eq!(a, b);

        std::fs::remove_dir_all(&repo).ok();
    }

    #[test]
    fn root_room_places_doors_and_files() {
        let repo = fixture_repo();
        let generator = GridMapGenerator::default();
        let tree = generator.build_tree(&repo).unwrap();
        let generated = generator.generate_node_map(&tree);

        let doors: Vec<&MapObject> = generated
            .objects
            .iter()
            .filter(|o| o.kind == ObjectKind::NavDoor)
            .collect();
        assert_eq!(doors.len(), 2);
        assert!(doors.iter().any(|d| d.label == "src"));
        assert!(doors
            .iter()
            .all(|d| d.metadata.get("target_path").is_some()));

        assert!(generated
            .objects
            .iter()
            .any(|o| o.label == "README.md" && o.kind == ObjectKind::Doc));
        assert!(generated
            .objects
            .iter()
            .any(|o| o.label == "config.toml" && o.kind == ObjectKind::Config));

        // Root has no way "up".
        assert!(!generated.objects.iter().any(|o| o.kind == ObjectKind::NavBack));

        // Every object stands on a walkable tile inside the border.
        for obj in &generated.objects {
            assert!(generated.map.is_walkable(obj.x, obj.y), "object {} on wall", obj.id);
        }
        assert!(generated.map.is_walkable(generated.entry_position.x, generated.entry_position.y));

        std::fs::remove_dir_all(&repo).ok();
    }

    #[test]
    fn nested_rooms_get_a_back_door() {
        let repo = fixture_repo();
        let generator = GridMapGenerator::default();
        let tree = generator.build_tree(&repo).unwrap();
        let src = tree.resolve("src").unwrap();
        let generated = generator.generate_node_map(src);

        let back = generated
            .objects
            .iter()
            .find(|o| o.kind == ObjectKind::NavBack)
            .expect("nested room without back door");
        assert_eq!(generated.map.tile(back.x, back.y), TILE_DOOR);

        std::fs::remove_dir_all(&repo).ok();
    }

    #[test]
    fn empty_folder_still_yields_a_walkable_room() {
        let node = MapNode {
            name: "empty".into(),
            path: "empty".into(),
            kind: MapNodeKind::Folder,
            children: vec![],
            map: None,
            objects: None,
            entry_position: None,
        };
        let generated = GridMapGenerator::default().generate_node_map(&node);
        assert!(generated.map.width >= 5);
        assert!(generated.map.is_walkable(generated.entry_position.x, generated.entry_position.y));
    }
}
