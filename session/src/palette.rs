use canvas::Color;

/// The 16 colors the service addresses by index in pixel updates.
const PALETTE: [[u8; 3]; 16] = [
    [255, 255, 255],
    [228, 228, 228],
    [136, 136, 136],
    [34, 34, 34],
    [255, 167, 209],
    [229, 0, 0],
    [229, 149, 0],
    [160, 106, 66],
    [229, 217, 0],
    [148, 224, 68],
    [2, 190, 1],
    [0, 211, 221],
    [0, 131, 199],
    [0, 0, 234],
    [207, 110, 228],
    [130, 0, 128],
];

pub fn color(index: u8) -> Option<Color> {
    PALETTE
        .get(index as usize)
        .map(|&[r, g, b]| Color::from_rgb8(r, g, b))
}
