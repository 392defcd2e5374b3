pub mod mfcc;
pub mod segmenter;
pub mod wav;
