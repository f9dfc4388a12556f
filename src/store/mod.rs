pub mod temp;
