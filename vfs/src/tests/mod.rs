mod persistence;
mod synchronization;
