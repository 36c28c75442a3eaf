//! Pure layout math mapping leaf indices to tile/bundle addresses.
//!
//! Everything here is side-effect free: no I/O, no locking, never fails.
//! Ported from the `tlog-tiles` tile-grid scheme described in the design:
//! a Merkle tree whose inner nodes are grouped into 8-level-tall, 256-wide
//! tiles, addressed by `(tileLevel, tileIndex)`.

/// Leaves (and entry bundles) per tile row / bundle.
pub const TILE_WIDTH: u64 = 256;
/// Tree levels spanned by a single tile.
pub const TILE_HEIGHT: u32 = 8;

/// Address of a hash tile: `tileLevel` counts in units of [`TILE_HEIGHT`]
/// tree levels, `tile_index` indexes tiles within that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileAddress {
    pub tile_level: u32,
    pub tile_index: u64,
}

/// Address of an entry bundle: a contiguous group of up to [`TILE_WIDTH`]
/// leaves, `bundle_index = leaf_index / TILE_WIDTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleAddress {
    pub bundle_index: u64,
}

/// `bundleIndex = leafIndex / 256`.
#[must_use]
pub const fn bundle_index(leaf_index: u64) -> u64 {
    leaf_index / TILE_WIDTH
}

/// Maps a tree node `(level, index)` (level 0 = leaves) onto the tile grid
/// that contains it, returning the tile address plus the node's coordinates
/// within that tile (`inner_level < TILE_HEIGHT`, `inner_index < row width`).
#[must_use]
pub const fn node_to_tile(tree_level: u32, tree_index: u64) -> (TileAddress, u32, u64) {
    let tile_level = tree_level / TILE_HEIGHT;
    let inner_level = tree_level % TILE_HEIGHT;
    let row_width = 1u64 << (TILE_HEIGHT - inner_level);
    let tile_index = tree_index / row_width;
    let inner_index = tree_index % row_width;
    (
        TileAddress {
            tile_level,
            tile_index,
        },
        inner_level,
        inner_index,
    )
}

/// Inverse of [`node_to_tile`]: recovers `(tree_level, tree_index)` from a
/// tile address and inner coordinates.
#[must_use]
pub const fn tile_to_node(tile: TileAddress, inner_level: u32, inner_index: u64) -> (u32, u64) {
    let tree_level = tile.tile_level * TILE_HEIGHT + inner_level;
    let row_width = 1u64 << (TILE_HEIGHT - inner_level);
    let tree_index = tile.tile_index * row_width + inner_index;
    (tree_level, tree_index)
}

/// Number of leaves below a full tile at `tile_level`: `256^(tile_level+1)`.
#[must_use]
pub fn leaves_per_tile(tile_level: u32) -> u64 {
    TILE_WIDTH.pow(tile_level + 1)
}

/// `partialTileSize(level, index, logSize)`: 0 if the tile addressed by
/// `(level, index)` is full under a tree of `log_size` leaves, else the
/// number of leaves currently below it.
#[must_use]
pub fn partial_tile_size(tile_level: u32, tile_index: u64, log_size: u64) -> u64 {
    let full_width = leaves_per_tile(tile_level);
    if (tile_index + 1) * full_width <= log_size {
        return 0;
    }
    let below = log_size.saturating_sub(tile_index * full_width);
    below.min(full_width)
}

/// Whether the tile is full (see [`partial_tile_size`], property 4 in the
/// design: `partialTileSize(L, I, N) == 0 iff I < N / 256^(L+1)`).
#[must_use]
pub fn is_tile_full(tile_level: u32, tile_index: u64, log_size: u64) -> bool {
    tile_index < log_size / leaves_per_tile(tile_level)
}

/// Enumerates every tile address touched by leaves `[start, end)`, across
/// every tile level from the base up to the level that contains the root
/// at tree size `end`. Used by the migration copier to build its work list
/// and exposed for external mirroring tools.
#[must_use]
pub fn tiles_for_range(start: u64, end: u64) -> Vec<TileAddress> {
    if start >= end {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut level = 0u32;
    loop {
        let width = leaves_per_tile(level);
        let first = start / width;
        let last = (end - 1) / width;
        for idx in first..=last {
            out.push(TileAddress {
                tile_level: level,
                tile_index: idx,
            });
        }
        if first == last && first == 0 {
            break;
        }
        level += 1;
        // Stop once a single tile at this level would cover the whole range.
        if leaves_per_tile(level) >= end {
            // still need to include the covering tile at `level`.
            out.push(TileAddress {
                tile_level: level,
                tile_index: 0,
            });
            break;
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Enumerates every bundle address spanning leaves `[start, end)`.
#[must_use]
pub fn bundles_for_range(start: u64, end: u64) -> Vec<BundleAddress> {
    if start >= end {
        return Vec::new();
    }
    let first = bundle_index(start);
    let last = bundle_index(end - 1);
    (first..=last).map(|bundle_index| BundleAddress { bundle_index }).collect()
}

/// `partial` count for a bundle at `bundle_index` given tree size `log_size`:
/// 0 if complete (256 leaves), else the number of leaves currently in it.
#[must_use]
pub fn bundle_partial_size(bundle_index: u64, log_size: u64) -> u64 {
    partial_tile_size(0, bundle_index, log_size)
}

/// Thousands-grouped path form: `x001/x234/567`. Each three-digit group
/// (from the right) gets an `x` prefix except the final, least-significant
/// group. This exact encoding is relied on by mirroring tools that address
/// tiles/bundles over HTTP and MUST be preserved
/// bit-for-bit.
#[must_use]
pub fn path_component(index: u64) -> String {
    let mut groups: Vec<String> = Vec::new();
    let mut rest = index;
    loop {
        groups.push(format!("{:03}", rest % 1000));
        rest /= 1000;
        if rest == 0 {
            break;
        }
    }
    groups.reverse();
    let mut out = String::new();
    let last = groups.len() - 1;
    for (n, group) in groups.iter().enumerate() {
        if n != 0 {
            out.push('/');
        }
        if n != last {
            out.push('x');
        }
        out.push_str(group);
    }
    out
}

/// `/tile/{level}/{index}[.p{partial}]` path, as written by the HTTP facade.
#[must_use]
pub fn tile_path(tile: TileAddress, partial: u64) -> String {
    let mut path = format!("tile/{}/{}", tile.tile_level, path_component(tile.tile_index));
    if partial != 0 {
        path.push_str(&format!(".p{partial}"));
    }
    path
}

/// `/tile/entries/{index}[.p{partial}]` path for an entry bundle.
#[must_use]
pub fn entry_path(bundle: BundleAddress, partial: u64) -> String {
    let mut path = format!("tile/entries/{}", path_component(bundle.bundle_index));
    if partial != 0 {
        path.push_str(&format!(".p{partial}"));
    }
    path
}

/// Inverse of [`path_component`] plus the optional `.p{partial}` suffix:
/// parses the request-path tail after `/tile/{level}/` or
/// `/tile/entries/` back into `(index, partial)`. Used by the HTTP facade
/// to route wildcard path segments; returns `None` for anything that
/// doesn't match the exact thousands-grouped encoding.
#[must_use]
pub fn parse_index_path(path: &str) -> Option<(u64, u64)> {
    let (body, partial) = match path.rfind(".p") {
        Some(pos) if path[pos + 2..].bytes().all(|b| b.is_ascii_digit()) && pos + 2 < path.len() => {
            (&path[..pos], path[pos + 2..].parse::<u64>().ok()?)
        }
        _ => (path, 0u64),
    };

    let groups: Vec<&str> = body.split('/').collect();
    let last = groups.len() - 1;
    let mut index: u64 = 0;
    for (n, group) in groups.iter().enumerate() {
        let digits = if n == last {
            group
        } else {
            group.strip_prefix('x')?
        };
        if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        index = index.checked_mul(1000)?.checked_add(digits.parse::<u64>().ok()?)?;
    }
    Some((index, partial))
}
