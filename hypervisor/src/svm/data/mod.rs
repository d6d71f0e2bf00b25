pub mod guest;
pub mod msr_bitmap;
pub mod nested;
pub mod nested_page_table;
pub mod shared_data;
pub mod vcpu_data;
