mod accounting;
pub mod page_manager;
pub mod page_table;
pub mod unused_block;
pub mod walker;

pub use self::accounting::PageAccounting;
pub use self::page_manager::PageManager;
pub use self::page_table::{PageTable, PageType};
