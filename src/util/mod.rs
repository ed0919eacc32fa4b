pub mod byte_queue;
