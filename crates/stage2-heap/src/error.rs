use snafu::{Location, Snafu};

/// Errors returned when handing an arena to a heap.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("heap already manages arena {start:#x}..{end:#x}"))]
    AlreadyInitialized {
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("empty arena {start:#x}..{end:#x}"))]
    EmptyArena {
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "arena {start:#x}..{end:#x} has {usable} usable bytes, at least {} required",
        crate::MIN_FREE_BLOCK_SIZE
    ))]
    ArenaTooSmall {
        start: usize,
        end: usize,
        usable: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
