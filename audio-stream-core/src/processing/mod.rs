pub mod converter;
pub mod pcm_ring;
