pub mod catchup;
pub mod guide_grab;
