//! Rebuild command implementation

use crate::error::Result;
use crate::library::{Library, RebuildStats};

/// Recreate the vector index from the stored chunk vectors
pub async fn cmd_rebuild(library: &Library) -> Result<RebuildStats> {
    let guard = library.lock_writes().await;
    library.rebuild(&guard).await
}

/// Print rebuild stats to console
pub fn print_rebuild_stats(stats: &RebuildStats) {
    println!("\n🔧 Index rebuilt\n");
    println!(
        "Vectors: {} -> {}",
        stats.vectors_before, stats.vectors_after
    );
    println!("Duration: {:.1}s", stats.duration_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::tests::{open_test_library, test_config};
    use crate::testing::FakeEmbedder;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_rebuild_empty_library() {
        let tmp = TempDir::new().unwrap();
        let library =
            open_test_library(test_config(&tmp), Arc::new(FakeEmbedder::new(4)), None).await;

        let stats = cmd_rebuild(&library).await.unwrap();
        assert_eq!((stats.vectors_before, stats.vectors_after), (0, 0));
        // The embedder's dimension fixes the empty index
        assert_eq!(library.index().dim().unwrap(), Some(4));
    }
}
