pub mod box_head;
pub mod stage_head;
