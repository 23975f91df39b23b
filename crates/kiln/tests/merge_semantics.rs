//! Integration tests for layer merging through the public API.
//!
//! These cover behavior that needs no privileges: file movement,
//! directory descent, emptied-source cleanup and rollback. Whiteout
//! handling needs mknod and is covered by the in-crate unit tests.

use std::error::Error;
use std::path::PathBuf;

use kiln::filesystem::LayerStack;
use tempfile::TempDir;

fn stack(temp: &TempDir, layer_names: &[&str]) -> Result<LayerStack, Box<dyn Error>> {
    let mut layers = Vec::new();
    for name in layer_names {
        let dir = temp.path().join(name);
        std::fs::create_dir_all(&dir)?;
        layers.push(dir);
    }
    Ok(LayerStack {
        mount_point: temp.path().join("mnt"),
        layers,
    })
}

fn write(layer: &PathBuf, rel: &str, content: &str) -> Result<(), Box<dyn Error>> {
    let path = layer.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[test]
fn merge_moves_and_replaces_files() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let stack = stack(&temp, &["dist", "diff"])?;
    write(&stack.layers[0], "etc/hosts", "old")?;
    write(&stack.layers[1], "etc/hosts", "new")?;
    write(&stack.layers[1], "etc/fresh.conf", "fresh")?;

    stack.merge()?;

    let dist = &stack.layers[0];
    assert_eq!(std::fs::read_to_string(dist.join("etc/hosts"))?, "new");
    assert_eq!(std::fs::read_to_string(dist.join("etc/fresh.conf"))?, "fresh");
    // The diff layer is drained, not copied.
    assert!(!stack.layers[1].join("etc/hosts").exists());
    Ok(())
}

#[test]
fn merge_drops_emptied_source_directories() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let stack = stack(&temp, &["dist", "diff"])?;
    std::fs::create_dir_all(stack.layers[0].join("var/log"))?;
    write(&stack.layers[1], "var/log/build.log", "done")?;

    stack.merge()?;

    assert!(stack.layers[0].join("var/log/build.log").is_file());
    assert!(!stack.layers[1].join("var").exists());
    Ok(())
}

#[test]
fn merge_into_moves_only_the_top_layer() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let stack = stack(&temp, &["dist", "local", "diff"])?;
    write(&stack.layers[0], "base.txt", "base")?;
    write(&stack.layers[2], "change.txt", "change")?;

    stack.merge_into(1)?;

    assert!(stack.layers[1].join("change.txt").is_file());
    // The distribution layer is untouched by a mid-stack merge.
    assert!(!stack.layers[0].join("change.txt").exists());
    assert_eq!(
        std::fs::read_to_string(stack.layers[0].join("base.txt"))?,
        "base"
    );
    Ok(())
}

#[test]
fn merge_is_idempotent() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let stack = stack(&temp, &["dist", "diff"])?;
    write(&stack.layers[1], "usr/bin/tool", "elf")?;

    stack.merge()?;
    stack.merge()?;

    assert_eq!(
        std::fs::read_to_string(stack.layers[0].join("usr/bin/tool"))?,
        "elf"
    );
    Ok(())
}

#[test]
fn rollback_empties_the_diff_layer() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let stack = stack(&temp, &["dist", "diff"])?;
    write(&stack.layers[1], "junk/leftover", "x")?;

    stack.rollback()?;

    assert!(stack.layers[1].is_dir());
    assert_eq!(std::fs::read_dir(&stack.layers[1])?.count(), 0);
    Ok(())
}
