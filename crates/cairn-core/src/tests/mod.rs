mod helpers;
mod scanner_passes;
