//! Block partitioning
//!
//! Works out how many parallel block invocations a call implies. Each
//! block-shaped argument implies a count on its own, and all of them must
//! agree.
//!
//! - non-overlapping: the array is tiled by the block shape, so every axis
//!   must be an exact multiple of the block extent;
//! - overlapping: one invocation per valid top-left position of a sliding
//!   window, `prod(S[i] - B[i] + 1)`;
//! - overlapping with center-as-origin: every element is the center of one
//!   block, so the count is the element count of the array.

use crate::error::{BlockwiseError, Result};
use crate::registry::{BlockShape, RegistryEntry};
use log::trace;

/// Overlap and anchor policy of a block function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    Tiled,
    Sliding,
    Centered,
}

impl BlockMode {
    pub fn new(overlapping: bool, center_as_origin: bool) -> Self {
        match (overlapping, center_as_origin) {
            (false, _) => BlockMode::Tiled,
            (true, false) => BlockMode::Sliding,
            (true, true) => BlockMode::Centered,
        }
    }

    pub fn of<K>(entry: &RegistryEntry<K>) -> Self {
        Self::new(entry.overlapping(), entry.center_as_origin())
    }
}

/// Number of blocks implied by one argument
pub fn argument_block_count(
    argument: &str,
    shape: &[usize],
    block: &BlockShape,
    mode: BlockMode,
) -> Result<usize> {
    let dims = block.dims();
    if shape.len() != dims.len() {
        return Err(BlockwiseError::ShapeMismatch {
            argument: argument.to_string(),
            shape: shape.to_vec(),
            block: dims.to_vec(),
        });
    }

    match mode {
        BlockMode::Centered => Ok(shape.iter().product()),
        BlockMode::Sliding => {
            if shape.iter().zip(dims).any(|(&s, &b)| b > s) {
                return Err(BlockwiseError::BlockTooLarge {
                    argument: argument.to_string(),
                    shape: shape.to_vec(),
                    block: dims.to_vec(),
                });
            }
            Ok(shape.iter().zip(dims).map(|(&s, &b)| s - (b - 1)).product())
        }
        BlockMode::Tiled => {
            if shape.iter().zip(dims).any(|(&s, &b)| s % b != 0) {
                return Err(BlockwiseError::IndivisibleBlockShape {
                    argument: argument.to_string(),
                    shape: shape.to_vec(),
                    block: dims.to_vec(),
                });
            }
            Ok(shape.iter().product::<usize>() / block.size())
        }
    }
}

/// Shared block count of a call
///
/// `arrays` holds the shape of every array argument; arguments without a
/// declared block shape are ignored. Block-shaped arguments are visited in
/// declaration order and the first one fixes the count.
pub fn block_count<'a, K>(
    entry: &RegistryEntry<K>,
    arrays: impl IntoIterator<Item = (&'a str, &'a [usize])>,
) -> Result<usize> {
    let mode = BlockMode::of(entry);
    let mut count: Option<usize> = None;

    for (argument, shape) in arrays {
        let Some(block) = entry.block_shape(argument) else {
            continue;
        };
        let found = argument_block_count(argument, shape, block, mode)?;
        trace!(
            "{}: argument '{}' {:?} / {} implies {} blocks",
            entry.name(),
            argument,
            shape,
            block,
            found
        );
        match count {
            Some(expected) if expected != found => {
                return Err(BlockwiseError::InconsistentBlockCount {
                    argument: argument.to_string(),
                    expected,
                    found,
                });
            }
            _ => count = Some(found),
        }
    }

    // registration guarantees at least one block-shaped argument, and the
    // dispatcher checks that every one of them was passed an array
    Ok(count.unwrap_or(0))
}
