use crate::error::Result;
use std::path::Path;
use tch::{Device, Kind, Tensor};

const PADDING: i64 = 2;

// Lay out a [n, c, h, w] batch in [-1, 1] as a single u8 image of `nrow` columns,
// with a 2-pixel black border around every tile.
pub fn image_grid(imgs: &Tensor, nrow: i64) -> Tensor {
    let imgs = (imgs.clamp(-1., 1.) + 1.) / 2.;
    let size = imgs.size();
    let (count, channels, height, width) = (size[0], size[1], size[2], size[3]);
    let grid = if count == 1 {
        imgs.squeeze_dim(0)
    } else {
        let ncol = nrow.min(count);
        let nrows = (count + ncol - 1) / ncol;
        let (cell_h, cell_w) = (height + PADDING, width + PADDING);
        let grid = Tensor::zeros(
            &[channels, cell_h * nrows + PADDING, cell_w * ncol + PADDING],
            (Kind::Float, imgs.device()),
        );
        for k in 0..count {
            let (y, x) = (k / ncol, k % ncol);
            let mut tile = grid
                .narrow(1, y * cell_h + PADDING, height)
                .narrow(2, x * cell_w + PADDING, width);
            tile.copy_(&imgs.get(k));
        }
        grid
    };
    (grid * 255. + 0.5).clamp(0., 255.).to_kind(Kind::Uint8)
}

pub fn save_grid(imgs: &Tensor, nrow: i64, path: impl AsRef<Path>) -> Result<()> {
    let matrix = image_grid(&imgs.to_device(Device::Cpu), nrow);
    tch::vision::image::save(&matrix, path)?;
    Ok(())
}
