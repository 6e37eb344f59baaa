// MIT License - Copyright (c) 2026 zway-core contributors
// Observable data tree mirroring protocol state

pub mod callback;
pub mod tree;
pub mod value;

pub use callback::{
    data_callback, CallbackArg, ChangeFlags, ChangeKind, DataCallback, DataCallbackRef, DataChange,
};
pub use tree::{ChildIter, DataLock, DataTree, HolderId};
pub use value::{DataType, DataValue};
