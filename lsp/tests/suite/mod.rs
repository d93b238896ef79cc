mod cache_identity;
mod correlation;
mod recovery;
