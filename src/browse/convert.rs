// Picture and sound conversion for the browse copy

/// Planar 4:2:0 buffer size for a raster
pub fn yuv420_size(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * (w / 2) * h.div_ceil(2)
}

/// Convert 8-bit UYVY 4:2:2 to planar 4:2:0 (I420). Chroma is averaged
/// over each pair of lines.
pub fn uyvy_to_yuv420(src: &[u8], width: u32, height: u32, out: &mut Vec<u8>) {
    let (w, h) = (width as usize, height as usize);
    let cw = w / 2;
    let ch = h.div_ceil(2);
    let stride = w * 2;

    out.clear();
    out.resize(yuv420_size(width, height), 0);
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for (row, line) in src.chunks_exact(stride).take(h).enumerate() {
        let y_row = &mut y_plane[row * w..(row + 1) * w];
        for (x, quad) in line.chunks_exact(4).enumerate() {
            y_row[2 * x] = quad[1];
            y_row[2 * x + 1] = quad[3];
        }
    }

    for crow in 0..ch {
        let top = 2 * crow;
        let bottom = (top + 1).min(h - 1);
        let top_line = &src[top * stride..(top + 1) * stride];
        let bottom_line = &src[bottom * stride..(bottom + 1) * stride];
        for x in 0..cw {
            let avg = |i: usize| ((top_line[4 * x + i] as u16 + bottom_line[4 * x + i] as u16 + 1) / 2) as u8;
            u_plane[crow * cw + x] = avg(0);
            v_plane[crow * cw + x] = avg(2);
        }
    }
}

/// Fill `out` with a black 4:2:0 picture
pub fn black_yuv420(width: u32, height: u32, out: &mut Vec<u8>) {
    let luma = width as usize * height as usize;
    out.clear();
    out.resize(yuv420_size(width, height), 128);
    out[..luma].fill(16);
}

/// Interleaved 32-bit stereo to interleaved 16-bit stereo
pub fn downmix_pair(pair: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        pair.chunks_exact(4)
            .map(|s| (i32::from_le_bytes([s[0], s[1], s[2], s[3]]) >> 16) as i16),
    );
}

/// Silence for one frame of interleaved stereo
pub fn silent_pair(samples_per_frame: u32, out: &mut Vec<i16>) {
    out.clear();
    out.resize(samples_per_frame as usize * 2, 0);
}
